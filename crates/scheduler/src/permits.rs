//! Bounded permit pool for decode work.
//!
//! Decoding is CPU and memory heavy, so the number of decodes allowed to run
//! at once is capped by a counting semaphore sized relative to the machine's
//! available parallelism. Permits are RAII guards: they are returned to the
//! pool on every exit path, including cancellation and panics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{Cancelled, CancellationToken};

/// Default multiplier applied to the CPU count.
pub const DEFAULT_PERMITS_PER_CPU: usize = 2;

/// Configuration for the permit pool.
#[derive(Debug, Clone)]
pub struct PermitPoolConfig {
    /// Maximum number of concurrent permits.
    /// Default: logical CPU cores * 2.
    pub max_permits: usize,

    /// Label used in log output.
    pub label: String,
}

impl Default for PermitPoolConfig {
    fn default() -> Self {
        Self::per_cpu(DEFAULT_PERMITS_PER_CPU)
    }
}

impl PermitPoolConfig {
    /// Create a configuration with a fixed permit count.
    pub fn new(max_permits: usize) -> Self {
        Self {
            max_permits: max_permits.max(1),
            label: "decode".to_string(),
        }
    }

    /// Create a configuration with `num_cpus() * permits_per_cpu` permits.
    pub fn per_cpu(permits_per_cpu: usize) -> Self {
        Self::new(num_cpus() * permits_per_cpu.max(1))
    }

    /// Set the label used in log output.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Counting semaphore with in-flight instrumentation.
///
/// # Example
///
/// ```
/// use artcache_scheduler::{CancellationToken, PermitPool, PermitPoolConfig};
///
/// # tokio_test_block_on(async {
/// let pool = PermitPool::new(PermitPoolConfig::new(2));
/// let token = CancellationToken::new();
///
/// let permit = pool.acquire(&token).await.unwrap();
/// assert_eq!(pool.in_flight(), 1);
/// drop(permit);
/// assert_eq!(pool.in_flight(), 0);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread()
/// #         .build()
/// #         .unwrap()
/// #         .block_on(f)
/// # }
/// ```
#[derive(Debug)]
pub struct PermitPool {
    semaphore: Arc<Semaphore>,
    max_permits: usize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    label: String,
}

impl PermitPool {
    pub fn new(config: PermitPoolConfig) -> Self {
        let max_permits = config.max_permits.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_permits)),
            max_permits,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            label: config.label,
        }
    }

    /// Wait for a permit, giving up as soon as `cancel` fires.
    ///
    /// Cancellation is checked before waiting, raced against the wait, and
    /// checked again once a permit is in hand; a permit obtained by a
    /// cancelled caller is released immediately.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Permit, Cancelled> {
        cancel.check()?;

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled),
            permit = self.semaphore.clone().acquire_owned() => permit,
        };

        // The semaphore is owned by the pool and never closed.
        let permit = permit.map_err(|_| Cancelled)?;
        cancel.check()?;

        Ok(self.track(permit))
    }

    /// Take a permit without waiting.
    pub fn try_acquire(&self) -> Option<Permit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.track(permit))
    }

    fn track(&self, permit: OwnedSemaphorePermit) -> Permit {
        let current = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::AcqRel);
        Permit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously held permits observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn reset_peak(&self) {
        self.peak_in_flight
            .store(self.in_flight(), Ordering::Release);
    }
}

impl Default for PermitPool {
    fn default() -> Self {
        Self::new(PermitPoolConfig::default())
    }
}

/// A held decode permit. Returned to the pool on drop.
///
/// Owns its bookkeeping so it can move into blocking tasks.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Get the number of logical CPU cores.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
