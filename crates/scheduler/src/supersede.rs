//! Generation tracking for superseded requests
//!
//! When a consumer (an image slot, a list row) switches its source quickly,
//! only the most recent request for that target may publish its result. Each
//! call to [`SupersedeRegistry::begin`] stamps the request with a fresh
//! generation and cancels the request it replaces. Results are committed
//! only while [`SupersedeRegistry::is_current`] holds.
//!
//! Every ticket carries its own token, a child of the caller's. Superseding
//! cancels that child only, so a caller may reuse one token across requests
//! and targets.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::CancellationToken;

/// Monotonically increasing request stamp.
///
/// Generations come from a single registry-wide counter, so a target that is
/// completed and later restarted can never reissue a generation held by a
/// stale ticket.
pub type Generation = u64;

struct Slot {
    generation: Generation,
    token: CancellationToken,
}

/// Handle for one request against a target.
#[derive(Debug, Clone)]
pub struct Ticket<T> {
    target: T,
    generation: Generation,
    token: CancellationToken,
}

impl<T> Ticket<T> {
    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// The cancellation token bound to this request.
    ///
    /// Fires when the caller's token fires or when a newer request for the
    /// same target begins.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Per-target registry of the latest request generation
///
/// # Example
///
/// ```
/// use artcache_scheduler::{CancellationToken, SupersedeRegistry};
///
/// let registry = SupersedeRegistry::new();
/// let caller = CancellationToken::new();
///
/// let first = registry.begin("cover", &caller);
/// let second = registry.begin("cover", &caller);
///
/// assert!(first.token().is_cancelled());
/// assert!(!second.token().is_cancelled());
/// assert!(!caller.is_cancelled());
/// assert!(registry.is_current(&second));
/// ```
pub struct SupersedeRegistry<T> {
    slots: Mutex<HashMap<T, Slot>>,
    next_generation: AtomicU64,
}

impl<T> SupersedeRegistry<T>
where
    T: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<T, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new request for `target`, superseding any in-flight one.
    ///
    /// The previous request's ticket token is cancelled; `cancel` itself is
    /// never cancelled by the registry.
    pub fn begin(&self, target: T, cancel: &CancellationToken) -> Ticket<T> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = cancel.child_token();
        let slot = Slot {
            generation,
            token: token.clone(),
        };

        let previous = self.slots().insert(target.clone(), slot);
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        Ticket {
            target,
            generation,
            token,
        }
    }

    /// Whether `ticket` is still the latest request for its target.
    pub fn is_current(&self, ticket: &Ticket<T>) -> bool {
        self.slots()
            .get(&ticket.target)
            .is_some_and(|slot| slot.generation == ticket.generation)
    }

    /// Run `commit` only if `ticket` is current, holding the registry lock
    /// for the duration so no newer request can begin in between.
    ///
    /// Returns `None` when the ticket was superseded.
    pub fn commit_if_current<R>(
        &self,
        ticket: &Ticket<T>,
        commit: impl FnOnce() -> R,
    ) -> Option<R> {
        let slots = self.slots();
        let current = slots
            .get(&ticket.target)
            .is_some_and(|slot| slot.generation == ticket.generation);
        if current {
            Some(commit())
        } else {
            None
        }
    }

    /// Release the slot for `ticket` if it is still current.
    ///
    /// Returns `true` if the slot was removed.
    pub fn complete(&self, ticket: &Ticket<T>) -> bool {
        let mut slots = self.slots();
        let current = slots
            .get(&ticket.target)
            .is_some_and(|slot| slot.generation == ticket.generation);
        if current {
            slots.remove(&ticket.target);
        }
        current
    }

    /// Cancel the in-flight request for `target`, if any.
    pub fn cancel(&self, target: &T) -> bool {
        match self.slots().remove(target) {
            Some(slot) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight request. Returns the number cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Slot> = self.slots().drain().map(|(_, slot)| slot).collect();
        for slot in &drained {
            slot.token.cancel();
        }
        drained.len()
    }

    pub fn current_generation(&self, target: &T) -> Option<Generation> {
        self.slots().get(target).map(|slot| slot.generation)
    }

    /// Number of targets with an in-flight request.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}

impl<T> Default for SupersedeRegistry<T>
where
    T: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
