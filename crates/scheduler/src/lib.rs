//! artcache scheduler library
//!
//! Coordination primitives for the decode pipeline: cooperative cancellation,
//! per-target request generations, and a bounded permit pool.
//!
//! # Example
//!
//! ```
//! use artcache_scheduler::{CancellationToken, SupersedeRegistry};
//!
//! let registry = SupersedeRegistry::new();
//! let view = CancellationToken::new();
//!
//! // A slot starts loading one source, then the user scrolls on.
//! let first = registry.begin("slot-3", &view);
//! let second = registry.begin("slot-3", &view);
//!
//! // The first request is cancelled and may no longer publish its result.
//! assert!(first.token().is_cancelled());
//! assert!(!view.is_cancelled());
//! assert!(registry.commit_if_current(&first, || ()).is_none());
//! assert!(registry.commit_if_current(&second, || ()).is_some());
//! ```

mod cancel;
mod permits;
mod supersede;

// Re-export public API
pub use cancel::{Cancelled, CancellationToken};
pub use permits::{Permit, PermitPool, PermitPoolConfig, DEFAULT_PERMITS_PER_CPU};
pub use supersede::{Generation, SupersedeRegistry, Ticket};
