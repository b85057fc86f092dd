//! Byte-budgeted keyed cache with LRU eviction
//!
//! Provides in-memory caching of arbitrary values whose size is declared by
//! the caller as a byte cost. When an insert would push the running total
//! over the configured capacity, the least recently used entries are evicted
//! until the new entry fits.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// A stored cache entry
///
/// Entries are immutable once stored; replacing a key swaps in a whole new
/// entry. Readers receive an `Arc` to the entry so they never observe a
/// partially updated value.
#[derive(Debug)]
pub struct CacheEntry<K, V, M = ()> {
    /// Key this entry is stored under
    pub key: K,

    /// The cached payload
    pub value: V,

    /// Bytes this entry contributes toward the capacity budget
    pub cost: usize,

    /// Opaque side-channel set by the owner at insert time
    ///
    /// Typically describes how `value` was produced so the owner can detect
    /// "same key, different semantics". Never affects cost accounting.
    pub metadata: M,

    /// When the entry was inserted
    pub inserted_at: Instant,
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries currently in cache
    pub entry_count: usize,

    /// Total cost of stored entries (bytes)
    pub memory_used: usize,

    /// Capacity (bytes)
    pub capacity: usize,

    /// Number of cache hits
    pub hits: u64,

    /// Number of cache misses
    pub misses: u64,

    /// Number of entries evicted to make room for inserts
    pub evictions: u64,

    /// Number of inserts rejected because the entry alone exceeds capacity
    pub rejections: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate capacity utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.memory_used as f64 / self.capacity as f64
        }
    }
}

struct Slot<K, V, M> {
    entry: Arc<CacheEntry<K, V, M>>,
    /// Position in the recency index
    tick: u64,
}

/// Internal cache state
///
/// The key index, the recency index and the running total only change
/// together while the state mutex is held.
struct CacheState<K, V, M> {
    entries: HashMap<K, Slot<K, V, M>>,

    /// Recency index: smallest tick is least recently used
    recency: BTreeMap<u64, K>,

    next_tick: u64,

    memory_used: usize,

    capacity: usize,

    stats: CacheStats,
}

impl<K, V, M> CacheState<K, V, M>
where
    K: Eq + Hash + Clone,
{
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            memory_used: 0,
            capacity,
            stats: CacheStats {
                capacity,
                ..Default::default()
            },
        }
    }

    fn bump_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Mark a key as most recently used
    fn touch(&mut self, key: &K) {
        let tick = self.bump_tick();
        if let Some(slot) = self.entries.get_mut(key) {
            let old = std::mem::replace(&mut slot.tick, tick);
            self.recency.remove(&old);
            self.recency.insert(tick, key.clone());
        }
    }

    fn remove_entry(&mut self, key: &K) -> Option<Arc<CacheEntry<K, V, M>>> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.tick);
        self.memory_used = self.memory_used.saturating_sub(slot.entry.cost);
        self.sync_stats();
        Some(slot.entry)
    }

    /// Evict the least recently used entry
    fn evict_lru(&mut self) -> Option<Arc<CacheEntry<K, V, M>>> {
        let (_, key) = self.recency.pop_first()?;
        let slot = self.entries.remove(&key)?;
        self.memory_used = self.memory_used.saturating_sub(slot.entry.cost);
        self.stats.evictions += 1;
        self.sync_stats();
        Some(slot.entry)
    }

    /// Evict entries until `required` more bytes fit under capacity
    fn evict_to_fit(&mut self, required: usize) {
        while self.memory_used + required > self.capacity && !self.entries.is_empty() {
            if self.evict_lru().is_none() {
                break;
            }
        }
    }

    fn insert(&mut self, entry: CacheEntry<K, V, M>) {
        let tick = self.bump_tick();
        let key = entry.key.clone();
        self.memory_used += entry.cost;
        self.recency.insert(tick, key.clone());
        let slot = Slot {
            entry: Arc::new(entry),
            tick,
        };
        self.entries.insert(key, slot);
        self.sync_stats();
    }

    fn sync_stats(&mut self) {
        self.stats.entry_count = self.entries.len();
        self.stats.memory_used = self.memory_used;
    }
}

/// Capacity-bound keyed cache with LRU eviction
///
/// Thread-safe. Every mutation (insert, removal, eviction) runs inside a
/// single critical section covering the key index and the running cost
/// total, so the total always equals the sum of stored entry costs and never
/// exceeds the capacity once an insert returns.
///
/// # Example
///
/// ```
/// use artcache_cache::ByteBudgetCache;
///
/// let cache: ByteBudgetCache<&str, Vec<u8>> = ByteBudgetCache::new(100);
///
/// assert!(cache.try_add("a", vec![0; 60], 60, ()));
/// assert!(cache.try_add("b", vec![0; 50], 50, ())); // evicts "a"
///
/// assert!(cache.try_get(&"a").is_none());
/// assert_eq!(cache.try_get(&"b").unwrap().cost, 50);
/// assert_eq!(cache.memory_used(), 50);
/// ```
pub struct ByteBudgetCache<K, V, M = ()> {
    state: Mutex<CacheState<K, V, M>>,
}

impl<K, V, M> ByteBudgetCache<K, V, M>
where
    K: Eq + Hash + Clone,
{
    /// Create a new cache with the specified capacity in bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::new(capacity)),
        }
    }

    /// Create a new cache with a capacity in megabytes
    pub fn with_mb_limit(megabytes: usize) -> Self {
        Self::new(megabytes * 1024 * 1024)
    }

    fn state(&self) -> MutexGuard<'_, CacheState<K, V, M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Retrieve an entry, marking it most recently used
    pub fn try_get(&self, key: &K) -> Option<Arc<CacheEntry<K, V, M>>> {
        let mut state = self.state();

        match state.entries.get(key).map(|slot| Arc::clone(&slot.entry)) {
            Some(entry) => {
                state.touch(key);
                state.stats.hits += 1;
                Some(entry)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Store a value under `key` with the given byte cost
    ///
    /// Any entry already stored under `key` is replaced and its cost
    /// released. Least recently used entries are evicted until the new entry
    /// fits. Returns `false` without touching the cache when `cost` alone
    /// exceeds the capacity.
    pub fn try_add(&self, key: K, value: V, cost: usize, metadata: M) -> bool {
        let mut state = self.state();

        if cost > state.capacity {
            state.stats.rejections += 1;
            tracing::warn!(
                cost,
                capacity = state.capacity,
                "cache entry exceeds capacity; not stored"
            );
            return false;
        }

        state.remove_entry(&key);
        state.evict_to_fit(cost);
        state.insert(CacheEntry {
            key,
            value,
            cost,
            metadata,
            inserted_at: Instant::now(),
        });

        true
    }

    /// Remove an entry. Returns `true` if it was present.
    pub fn try_remove(&self, key: &K) -> bool {
        self.state().remove_entry(key).is_some()
    }

    /// Remove an entry and hand it back
    pub fn take(&self, key: &K) -> Option<Arc<CacheEntry<K, V, M>>> {
        self.state().remove_entry(key)
    }

    /// Remove every entry matching `predicate`. Returns the number removed.
    pub fn remove_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&CacheEntry<K, V, M>) -> bool,
    {
        let mut state = self.state();
        let doomed: Vec<K> = state
            .entries
            .values()
            .filter(|slot| predicate(&slot.entry))
            .map(|slot| slot.entry.key.clone())
            .collect();

        for key in &doomed {
            state.remove_entry(key);
        }
        doomed.len()
    }

    /// Check if a key is present without updating recency
    pub fn contains(&self, key: &K) -> bool {
        self.state().entries.contains_key(key)
    }

    /// Clear all entries from the cache
    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.recency.clear();
        state.memory_used = 0;
        state.sync_stats();
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        self.state().stats
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> usize {
        self.state().capacity
    }

    /// Total cost of stored entries in bytes
    pub fn memory_used(&self) -> usize {
        self.state().memory_used
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    /// Keys ordered from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.state().recency.values().cloned().collect()
    }
}

impl<K, V, M> Default for ByteBudgetCache<K, V, M>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache with a default 100MB capacity
    fn default() -> Self {
        Self::with_mb_limit(100)
    }
}

impl<K, V, M> std::fmt::Debug for ByteBudgetCache<K, V, M>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBudgetCache")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::thread;

    fn sum_of_costs<K, V, M>(cache: &ByteBudgetCache<K, V, M>) -> usize
    where
        K: Eq + Hash + Clone,
    {
        cache
            .state()
            .entries
            .values()
            .map(|slot| slot.entry.cost)
            .sum()
    }

    #[test]
    fn test_basic_add_get() {
        let cache = ByteBudgetCache::new(1024);

        assert!(cache.try_add(1u64, "one", 100, ()));

        let entry = cache.try_get(&1).expect("entry should be in cache");
        assert_eq!(entry.key, 1);
        assert_eq!(entry.value, "one");
        assert_eq!(entry.cost, 100);
    }

    #[test]
    fn test_cache_miss() {
        let cache: ByteBudgetCache<u64, ()> = ByteBudgetCache::new(1024);

        assert!(cache.try_get(&999).is_none());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_capacity_example_sequence() {
        let cache = ByteBudgetCache::new(100);

        assert!(cache.try_add("A", (), 60, ()));
        assert!(cache.try_add("B", (), 50, ()));

        assert!(!cache.contains(&"A"));
        assert!(cache.contains(&"B"));
        assert_eq!(cache.memory_used(), 50);

        assert!(cache.try_add("C", (), 10, ()));
        assert!(cache.contains(&"B"));
        assert!(cache.contains(&"C"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.memory_used(), 60);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_oversized_entry_rejected_without_disturbing() {
        let cache = ByteBudgetCache::new(100);

        assert!(cache.try_add("keep", 1, 40, ()));
        assert!(!cache.try_add("huge", 2, 101, ()));

        assert!(cache.contains(&"keep"));
        assert!(!cache.contains(&"huge"));
        assert_eq!(cache.memory_used(), 40);
        assert_eq!(cache.stats().rejections, 1);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_oversized_replacement_keeps_prior_entry() {
        let cache = ByteBudgetCache::new(100);

        assert!(cache.try_add("k", 1, 40, ()));
        assert!(!cache.try_add("k", 2, 200, ()));

        assert_eq!(cache.try_get(&"k").unwrap().value, 1);
        assert_eq!(cache.memory_used(), 40);
    }

    #[test]
    fn test_entry_exactly_at_capacity_fits() {
        let cache = ByteBudgetCache::new(100);

        assert!(cache.try_add("a", (), 30, ()));
        assert!(cache.try_add("full", (), 100, ()));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_used(), 100);
    }

    #[test]
    fn test_lru_ordering() {
        let cache = ByteBudgetCache::new(100);

        cache.try_add(1, (), 40, ());
        cache.try_add(2, (), 40, ());

        // Access 1 so 2 becomes least recently used
        assert!(cache.try_get(&1).is_some());

        cache.try_add(3, (), 40, ());

        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
        assert_eq!(cache.keys_by_recency(), vec![1, 3]);
    }

    #[test]
    fn test_contains_does_not_touch() {
        let cache = ByteBudgetCache::new(100);

        cache.try_add(1, (), 50, ());
        cache.try_add(2, (), 50, ());
        assert!(cache.contains(&1));

        cache.try_add(3, (), 50, ());
        assert!(!cache.contains(&1));
    }

    #[test]
    fn test_replace_same_key_updates_cost() {
        let cache = ByteBudgetCache::new(100);

        cache.try_add("k", "small", 10, "v1");
        cache.try_add("k", "large", 70, "v2");

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_used(), 70);
        let entry = cache.try_get(&"k").unwrap();
        assert_eq!(entry.value, "large");
        assert_eq!(entry.metadata, "v2");
        assert_eq!(sum_of_costs(&cache), 70);
    }

    #[test]
    fn test_replacing_does_not_evict_itself_first() {
        let cache = ByteBudgetCache::new(100);

        cache.try_add("other", (), 50, ());
        cache.try_add("k", (), 50, ());
        // Old "k" is released before eviction, so "other" survives.
        cache.try_add("k", (), 50, ());

        assert!(cache.contains(&"other"));
        assert_eq!(cache.memory_used(), 100);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_try_remove() {
        let cache = ByteBudgetCache::new(100);

        cache.try_add(1, (), 30, ());
        assert!(cache.try_remove(&1));
        assert!(!cache.try_remove(&1));
        assert_eq!(cache.memory_used(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_take_returns_entry() {
        let cache = ByteBudgetCache::new(100);

        cache.try_add(1, "v", 30, ());
        let taken = cache.take(&1).expect("entry");
        assert_eq!(taken.value, "v");
        assert!(cache.take(&1).is_none());
    }

    #[test]
    fn test_remove_where() {
        let cache = ByteBudgetCache::new(1000);

        cache.try_add(("cover", 100), (), 10, ());
        cache.try_add(("cover", 200), (), 20, ());
        cache.try_add(("icon", 100), (), 30, ());

        let removed = cache.remove_where(|entry| entry.key.0 == "cover");
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_used(), 30);
        assert_eq!(cache.keys_by_recency(), vec![("icon", 100)]);
    }

    #[test]
    fn test_clear() {
        let cache = ByteBudgetCache::new(100);

        cache.try_add(1, (), 10, ());
        cache.try_add(2, (), 10, ());
        cache.clear();

        assert_eq!(cache.len(), 0);
        assert_eq!(cache.memory_used(), 0);
        assert!(cache.keys_by_recency().is_empty());
    }

    #[test]
    fn test_stats() {
        let cache = ByteBudgetCache::new(100);

        cache.try_add(1, (), 25, ());
        let _ = cache.try_get(&1);
        let _ = cache.try_get(&2);
        let _ = cache.try_get(&3);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.memory_used, 25);
        assert_eq!(stats.capacity, 100);
        assert!((stats.hit_rate() - 0.333).abs() < 0.01);
        assert!((stats.utilization() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_cost_entries() {
        let cache = ByteBudgetCache::new(10);

        for i in 0..100 {
            assert!(cache.try_add(i, (), 0, ()));
        }
        assert_eq!(cache.len(), 100);
        assert_eq!(cache.memory_used(), 0);
    }

    #[test]
    fn test_default_cache() {
        let cache: ByteBudgetCache<u64, ()> = ByteBudgetCache::default();
        assert_eq!(cache.capacity(), 100 * 1024 * 1024);
    }

    #[test]
    fn test_random_sequence_never_exceeds_capacity() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let cache = ByteBudgetCache::new(10_000);

        for _ in 0..5_000 {
            let key = rng.gen_range(0..200u32);
            let cost = rng.gen_range(0..3_000usize);
            if rng.gen_bool(0.1) {
                cache.try_remove(&key);
            } else {
                cache.try_add(key, (), cost, ());
            }
            assert!(cache.memory_used() <= cache.capacity());
            assert_eq!(cache.memory_used(), sum_of_costs(&cache));
        }
    }

    #[test]
    fn test_concurrent_access_keeps_accounting_exact() {
        let cache = Arc::new(ByteBudgetCache::new(64 * 1024));
        let mut handles = vec![];

        for thread_id in 0..8u64 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(thread_id);
                for _ in 0..2_000 {
                    // Overlapping key ranges so threads contend on the same keys
                    let key = rng.gen_range(0..256u64);
                    match rng.gen_range(0..3) {
                        0 => {
                            cache.try_add(key, thread_id, rng.gen_range(1..4096), ());
                        }
                        1 => {
                            cache.try_get(&key);
                        }
                        _ => {
                            cache.try_remove(&key);
                        }
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = cache.stats();
        assert!(stats.memory_used <= 64 * 1024);
        assert_eq!(stats.memory_used, sum_of_costs(&cache));
        assert_eq!(stats.entry_count, cache.keys_by_recency().len());
    }
}
