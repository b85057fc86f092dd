//! Directory size cache
//!
//! Summing a directory tree is slow, so computed sizes are remembered per
//! `(path, on_disk)` pair. An entry stays valid while the directory's own
//! last-write time is unchanged and the entry is younger than the TTL.
//! Unreadable subtrees contribute zero instead of failing the whole walk,
//! and a listing that fails midway keeps what it summed before the error.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use artcache_scheduler::{Cancelled, CancellationToken};

use crate::config::CacheConfig;

/// Source of "now" for TTL checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: SystemTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SystemTime::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SizeKey {
    path: PathBuf,
    on_disk: bool,
}

#[derive(Debug, Clone, Copy)]
struct SizeEntry {
    size: u64,
    dir_modified: SystemTime,
    cached_at: SystemTime,
}

/// Statistics about directory size lookups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirSizeStats {
    /// Number of cached sizes
    pub entries: usize,

    /// Lookups answered from the table
    pub hits: u64,

    /// Lookups that needed a walk
    pub misses: u64,

    /// Completed directory walks, cached or not
    pub walks: u64,

    /// Number of batch evictions triggered by the entry limit
    pub batch_evictions: u64,
}

struct SizeTable {
    entries: HashMap<SizeKey, SizeEntry>,
    stats: DirSizeStats,
}

/// Outcome of summing one subtree.
enum Subtree {
    Size(u64),
    Unreadable(io::Error),
}

impl Subtree {
    fn bytes(self, dir: &Path) -> u64 {
        match self {
            Subtree::Size(size) => size,
            Subtree::Unreadable(err) => {
                tracing::debug!(
                    path = %dir.display(),
                    error = %err,
                    "skipping unreadable directory"
                );
                0
            }
        }
    }
}

/// Cache of recursive directory sizes with TTL and mtime invalidation
pub struct DirectorySizeCache {
    table: Mutex<SizeTable>,
    ttl: Duration,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl DirectorySizeCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
    pub const DEFAULT_MAX_ENTRIES: usize = 512;

    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            table: Mutex::new(SizeTable {
                entries: HashMap::new(),
                stats: DirSizeStats::default(),
            }),
            ttl,
            max_entries: max_entries.max(1),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.dir_size_ttl, config.dir_size_max_entries)
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn table(&self) -> MutexGuard<'_, SizeTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total size of all files under `path`.
    ///
    /// With `on_disk` set, each file counts its allocated size rather than
    /// its length. A cached value is reused while the directory's last-write
    /// time matches and the entry has not outlived the TTL. A directory whose
    /// last-write time cannot be read is summed but not cached.
    pub fn get_or_compute(
        &self,
        path: &Path,
        on_disk: bool,
        cancel: &CancellationToken,
    ) -> Result<u64, Cancelled> {
        let key = SizeKey {
            path: normalize(path),
            on_disk,
        };
        let dir_modified = fs::metadata(path).and_then(|meta| meta.modified()).ok();

        if let Some(modified) = dir_modified {
            let now = self.clock.now();
            let mut table = self.table();
            match table.entries.get(&key).copied() {
                Some(entry) if entry.dir_modified == modified && !self.expired(&entry, now) => {
                    table.stats.hits += 1;
                    return Ok(entry.size);
                }
                Some(_) => {
                    table.entries.remove(&key);
                }
                None => {}
            }
        }
        self.table().stats.misses += 1;

        let size = self.walk_root(path, on_disk, cancel)?;

        if let Some(modified) = dir_modified {
            let mut table = self.table();
            let entry = SizeEntry {
                size,
                dir_modified: modified,
                cached_at: self.clock.now(),
            };
            table.entries.insert(key, entry);
            if table.entries.len() > self.max_entries {
                evict_oldest_quarter(&mut table);
            }
        }

        Ok(size)
    }

    /// Sum `path` without reading or writing the table.
    pub fn get_or_compute_uncached(
        &self,
        path: &Path,
        on_disk: bool,
        cancel: &CancellationToken,
    ) -> Result<u64, Cancelled> {
        self.walk_root(path, on_disk, cancel)
    }

    /// Drop cached sizes for `path` in both modes.
    ///
    /// Returns `true` if any were present.
    pub fn invalidate(&self, path: &Path) -> bool {
        let path = normalize(path);
        let mut table = self.table();
        let mut removed = false;
        for on_disk in [false, true] {
            let key = SizeKey {
                path: path.clone(),
                on_disk,
            };
            removed |= table.entries.remove(&key).is_some();
        }
        table.stats.entries = table.entries.len();
        removed
    }

    pub fn clear(&self) {
        let mut table = self.table();
        table.entries.clear();
        table.stats.entries = 0;
    }

    pub fn len(&self) -> usize {
        self.table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn stats(&self) -> DirSizeStats {
        let table = self.table();
        DirSizeStats {
            entries: table.entries.len(),
            ..table.stats
        }
    }

    fn expired(&self, entry: &SizeEntry, now: SystemTime) -> bool {
        // A clock that moved backwards counts as expired.
        now.duration_since(entry.cached_at)
            .map_or(true, |age| age >= self.ttl)
    }

    fn walk_root(
        &self,
        path: &Path,
        on_disk: bool,
        cancel: &CancellationToken,
    ) -> Result<u64, Cancelled> {
        let size = walk(path, on_disk, cancel)?.bytes(path);
        self.table().stats.walks += 1;
        Ok(size)
    }
}

impl Default for DirectorySizeCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL, Self::DEFAULT_MAX_ENTRIES)
    }
}

impl std::fmt::Debug for DirectorySizeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorySizeCache")
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .field("stats", &self.stats())
            .finish()
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

fn evict_oldest_quarter(table: &mut SizeTable) {
    let mut by_age: Vec<(SystemTime, SizeKey)> = table
        .entries
        .iter()
        .map(|(key, entry)| (entry.cached_at, key.clone()))
        .collect();
    by_age.sort_by_key(|(cached_at, _)| *cached_at);

    let count = (by_age.len() / 4).max(1);
    for (_, key) in by_age.into_iter().take(count) {
        table.entries.remove(&key);
    }
    table.stats.batch_evictions += 1;
    tracing::debug!(
        evicted = count,
        remaining = table.entries.len(),
        "directory size cache trimmed"
    );
}

/// Depth-first sum of file sizes under `dir`.
fn walk(dir: &Path, on_disk: bool, cancel: &CancellationToken) -> Result<Subtree, Cancelled> {
    cancel.check()?;

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => return Ok(Subtree::Unreadable(err)),
    };

    let total = sum_entries(dir, entries, cancel, |entry| {
        entry_size(&entry, on_disk, cancel)
    })?;
    Ok(Subtree::Size(total))
}

/// Add up `entries` until the listing fails, keeping what was summed so far.
fn sum_entries<E>(
    dir: &Path,
    entries: impl IntoIterator<Item = io::Result<E>>,
    cancel: &CancellationToken,
    mut size_of: impl FnMut(E) -> Result<u64, Cancelled>,
) -> Result<u64, Cancelled> {
    let mut total = 0u64;
    for entry in entries {
        cancel.check()?;
        match entry {
            Ok(entry) => total += size_of(entry)?,
            Err(err) => {
                tracing::debug!(
                    path = %dir.display(),
                    error = %err,
                    partial = total,
                    "directory listing ended early"
                );
                break;
            }
        }
    }
    Ok(total)
}

fn entry_size(
    entry: &fs::DirEntry,
    on_disk: bool,
    cancel: &CancellationToken,
) -> Result<u64, Cancelled> {
    let file_type = match entry.file_type() {
        Ok(file_type) => file_type,
        Err(err) => {
            tracing::debug!(path = %entry.path().display(), error = %err, "skipping entry");
            return Ok(0);
        }
    };

    if file_type.is_dir() {
        if entry.file_name().to_string_lossy().trim().is_empty() {
            return Ok(0);
        }
        let child = entry.path();
        Ok(walk(&child, on_disk, cancel)?.bytes(&child))
    } else if file_type.is_file() {
        Ok(file_size(entry, on_disk))
    } else {
        Ok(0)
    }
}

fn file_size(entry: &fs::DirEntry, on_disk: bool) -> u64 {
    let metadata = match entry.metadata() {
        Ok(metadata) => metadata,
        Err(err) => {
            tracing::debug!(path = %entry.path().display(), error = %err, "skipping file");
            return 0;
        }
    };

    if on_disk {
        filesize::file_real_size_fast(entry.path(), &metadata)
            .unwrap_or_else(|_| metadata.len())
    } else {
        metadata.len()
    }
}
