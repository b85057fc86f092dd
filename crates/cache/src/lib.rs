//! artcache cache library
//!
//! Bounded in-memory caches: a byte-budgeted LRU store for decoded
//! resources and a TTL cache of recursive directory sizes.

pub mod budget;
pub mod config;
pub mod dir_size;

pub use budget::{ByteBudgetCache, CacheEntry, CacheStats};
pub use config::{CacheConfig, ConfigError};
pub use dir_size::{Clock, DirSizeStats, DirectorySizeCache, ManualClock, SystemClock};
