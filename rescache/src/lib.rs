//! Bounded cache of expensive derived resources
//!
//! [`BoundedCache`] keeps at most a fixed number of values, evicting the
//! oldest-inserted one when a new key comes in. Values are handed out as
//! [`Arc`]s: a value's resources are released (its `Drop` implementation runs)
//! exactly once, when the cache and every consumer are done with it. Once a
//! value has left the cache by eviction, replacement or clearing, no new
//! consumer can obtain it.

#![deny(missing_docs)]

use log::{debug, trace};
use std::{
    collections::VecDeque,
    fmt::{self, Debug, Formatter},
    num::NonZeroUsize,
    sync::{Arc, Mutex, MutexGuard},
};

/// Thread-safe cache holding at most `max_entries` values
pub struct BoundedCache<K, V> {
    /// Maximal number of entries
    max_entries: NonZeroUsize,

    /// Entries and statistics, behind the lock that serializes all operations
    state: Mutex<CacheState<K, V>>,
}
//
impl<K: Eq, V> BoundedCache<K, V> {
    /// Set up an empty cache
    pub fn new(max_entries: NonZeroUsize) -> Self {
        Self {
            max_entries,
            state: Mutex::new(CacheState {
                entries: VecDeque::with_capacity(max_entries.get()),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Maximal number of entries
    pub fn max_entries(&self) -> NonZeroUsize {
        self.max_entries
    }

    /// Insert a value, evicting the oldest entry if the cache is full
    ///
    /// If the key is already present, the previous value is replaced. Any
    /// value that leaves the cache is released after the cache lock is
    /// dropped, unless a consumer still holds it.
    ///
    pub fn add(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let mut state = self.lock();
        let mut released = Vec::new();
        if let Some(pos) = state.position(&key) {
            released.extend(state.entries.remove(pos));
            state.stats.replacements += 1;
        } else if state.entries.len() >= self.max_entries.get() {
            released.extend(state.entries.pop_front());
            state.stats.evictions += 1;
        }
        state.entries.push_back((key, value.clone()));
        state.stats.insertions += 1;
        drop(state);
        Self::release(released, "replaced or evicted");
        value
    }

    /// Look up a value
    pub fn try_get(&self, key: &K) -> Option<Arc<V>> {
        let mut state = self.lock();
        let value = state
            .position(key)
            .map(|pos| state.entries[pos].1.clone());
        if value.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        value
    }

    /// Look up a value, computing and inserting it if absent
    ///
    /// The value is computed without holding the cache lock, so concurrent
    /// callers may compute the same value. The last one to finish wins, and
    /// the other values are released as replacements.
    ///
    pub fn get_or_try_insert_with<E>(
        &self,
        key: K,
        make_value: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if let Some(value) = self.try_get(&key) {
            return Ok(value);
        }
        Ok(self.add(key, make_value()?))
    }

    /// Remove a value from the cache
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let mut state = self.lock();
        let removed = state
            .position(key)
            .and_then(|pos| state.entries.remove(pos));
        drop(state);
        removed.map(|(_, value)| value)
    }

    /// Remove every entry, releasing values that no consumer holds
    pub fn clear(&self) {
        let mut state = self.lock();
        let released = state.entries.drain(..).collect::<Vec<_>>();
        drop(state);
        Self::release(released, "cleared");
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Truth that the cache holds no entry
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Usage statistics
    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    /// Acquire the cache lock
    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().expect("Cache lock was poisoned")
    }

    /// Drop entries which left the cache
    fn release(entries: Vec<(K, Arc<V>)>, reason: &str) {
        if entries.is_empty() {
            return;
        }
        debug!("Releasing {} {reason} cache entries", entries.len());
        for (_, value) in entries {
            trace!(
                "- Dropping cache reference, {} other consumer(s) remain",
                Arc::strong_count(&value) - 1
            );
        }
    }
}
//
impl<K, V> Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        let mut debug = f.debug_struct("BoundedCache");
        debug.field("max_entries", &self.max_entries);
        if let Ok(state) = self.state.try_lock() {
            debug
                .field("len", &state.entries.len())
                .field("stats", &state.stats);
        }
        // Keys and values are elided as they may be huge
        debug.finish_non_exhaustive()
    }
}

/// Lock-protected state of a BoundedCache
struct CacheState<K, V> {
    /// Entries, from oldest to newest insertion
    entries: VecDeque<(K, Arc<V>)>,

    /// Usage statistics
    stats: CacheStats,
}
//
impl<K: Eq, V> CacheState<K, V> {
    /// Position of a key in the entry list
    fn position(&self, key: &K) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }
}

/// Usage statistics of a BoundedCache
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    /// Lookups which found a value
    pub hits: u64,

    /// Lookups which found nothing
    pub misses: u64,

    /// Values inserted
    pub insertions: u64,

    /// Values evicted to make room for new keys
    pub evictions: u64,

    /// Values replaced by a new value with the same key
    pub replacements: u64,
}
//
impl CacheStats {
    /// Fraction of lookups which found a value
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use simplelog::{Config, LevelFilter, TestLogger};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Value which counts how many times it was released
    #[derive(Debug)]
    struct Tracked {
        id: usize,
        releases: Arc<AtomicUsize>,
    }
    //
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Release counters for values 0..len
    fn counters(len: usize) -> Vec<Arc<AtomicUsize>> {
        (0..len).map(|_| Arc::new(AtomicUsize::new(0))).collect()
    }

    fn tracked(counters: &[Arc<AtomicUsize>], id: usize) -> Tracked {
        Tracked {
            id,
            releases: counters[id].clone(),
        }
    }

    fn releases(counters: &[Arc<AtomicUsize>]) -> Vec<usize> {
        counters
            .iter()
            .map(|counter| counter.load(Ordering::SeqCst))
            .collect()
    }

    fn cache(max_entries: usize) -> BoundedCache<usize, Tracked> {
        let _ = TestLogger::init(LevelFilter::Trace, Config::default());
        BoundedCache::new(NonZeroUsize::new(max_entries).unwrap())
    }

    #[test]
    fn eviction() {
        let counters = counters(6);
        let cache = cache(4);
        for key in 1..=4 {
            cache.add(key, tracked(&counters, key));
        }
        assert_eq!(cache.len(), 4);
        assert_eq!(releases(&counters), [0; 6]);

        cache.add(5, tracked(&counters, 5));
        assert_eq!(releases(&counters), [0, 1, 0, 0, 0, 0]);
        assert!(cache.try_get(&1).is_none());
        assert_eq!(cache.try_get(&2).map(|value| value.id), Some(2));
        assert_eq!(cache.len(), 4);

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);

        // Eviction and a later clear never release the same value twice
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(releases(&counters), [0, 1, 1, 1, 1, 1]);
    }

    #[test]
    fn clear_releases_everything() {
        let counters = counters(3);
        let cache = cache(4);
        for key in 0..3 {
            cache.add(key, tracked(&counters, key));
        }
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
        assert_eq!(releases(&counters), [1, 1, 1]);
        cache.clear();
        assert_eq!(releases(&counters), [1, 1, 1]);
    }

    #[test]
    fn lookups_do_not_release() {
        let counters = counters(1);
        let cache = cache(2);
        cache.add(0, tracked(&counters, 0));
        for _ in 0..10 {
            assert_eq!(cache.try_get(&0).map(|value| value.id), Some(0));
        }
        assert_eq!(releases(&counters), [0]);
    }

    #[test]
    fn replacement_releases_previous_value() {
        let counters = counters(2);
        let cache = cache(2);
        cache.add(7, tracked(&counters, 0));
        cache.add(7, tracked(&counters, 1));
        assert_eq!(releases(&counters), [1, 0]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().replacements, 1);
        assert_eq!(cache.try_get(&7).map(|value| value.id), Some(1));
    }

    #[test]
    fn consumers_delay_release() {
        let counters = counters(2);
        let cache = cache(1);
        let held = cache.add(0, tracked(&counters, 0));
        cache.add(1, tracked(&counters, 1));
        assert!(cache.try_get(&0).is_none());
        assert_eq!(releases(&counters), [0, 0]);
        drop(held);
        assert_eq!(releases(&counters), [1, 0]);
    }

    #[test]
    fn get_or_insert() {
        let counters = counters(2);
        let cache = cache(2);
        let first = cache
            .get_or_try_insert_with(3, || Ok::<_, ()>(tracked(&counters, 0)))
            .unwrap();
        let second = cache
            .get_or_try_insert_with(3, || Ok::<_, ()>(tracked(&counters, 1)))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            cache
                .get_or_try_insert_with(4, || Err::<Tracked, _>("failed"))
                .unwrap_err(),
            "failed"
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(releases(&counters), [0, 0]);

        let removed = cache.remove(&3).unwrap();
        assert!(cache.is_empty());
        assert_eq!(removed.id, 0);
        assert!(cache.remove(&3).is_none());
    }

    #[test]
    fn concurrent_access() {
        const THREADS: usize = 4;
        const KEYS_PER_THREAD: usize = 50;
        let counters = counters(THREADS * KEYS_PER_THREAD);
        let cache = cache(8);
        std::thread::scope(|scope| {
            for thread in 0..THREADS {
                let (cache, counters) = (&cache, &counters);
                scope.spawn(move || {
                    for offset in 0..KEYS_PER_THREAD {
                        let id = thread * KEYS_PER_THREAD + offset;
                        cache.add(id, tracked(counters, id));
                        if let Some(value) = cache.try_get(&id) {
                            assert_eq!(value.id, id);
                        }
                        if offset % 17 == 0 {
                            cache.clear();
                        }
                        assert!(cache.len() <= 8);
                    }
                });
            }
        });
        cache.clear();
        assert_eq!(releases(&counters), vec![1; THREADS * KEYS_PER_THREAD]);
    }

    proptest! {
        #[test]
        fn released_exactly_once(keys in prop::collection::vec(0usize..8, 0..64), max_entries in 1usize..6) {
            let counters = counters(keys.len());
            let cache = cache(max_entries);
            for (id, &key) in keys.iter().enumerate() {
                cache.add(key, tracked(&counters, id));
                prop_assert!(cache.len() <= max_entries);
                prop_assert!(releases(&counters).iter().all(|&count| count <= 1));
            }
            cache.clear();
            prop_assert!(releases(&counters).iter().all(|&count| count == 1));
        }
    }
}
