//! Per-frame object caches.

use std::collections::HashMap;
use std::hash::Hash;

/// Map from a structural key to a device handle, filled on miss.
///
/// There is no implicit eviction: entries live until [`drain`](Self::drain),
/// which hands them back to the owner for destruction.
///
/// # Example
///
/// ```
/// use framepace_renderer::cache::FrameCache;
///
/// let mut cache: FrameCache<&str, u32> = FrameCache::new();
/// let mut created = 0;
///
/// for _ in 0..3 {
///     let value = cache.get_or_try_insert_with(&"key", || {
///         created += 1;
///         Ok::<_, ()>(42)
///     });
///     assert_eq!(value, Ok(42));
/// }
///
/// assert_eq!(created, 1);
/// assert_eq!((cache.hits(), cache.misses()), (2, 1));
/// ```
#[derive(Debug)]
pub struct FrameCache<K, V> {
    entries: HashMap<K, V>,
    hits: u64,
    misses: u64,
}

impl<K: Eq + Hash + Clone, V: Copy> FrameCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Returns the cached value for `key`, or creates, stores and returns it.
    ///
    /// A failed `create` leaves the cache unchanged.
    pub fn get_or_try_insert_with<E, F>(&mut self, key: &K, create: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(&value) = self.entries.get(key) {
            self.hits += 1;
            return Ok(value);
        }

        let value = create()?;
        self.misses += 1;
        self.entries.insert(key.clone(), value);
        Ok(value)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).copied()
    }

    /// Removes every entry and returns the values.
    pub fn drain(&mut self) -> Vec<V> {
        self.entries.drain().map(|(_, value)| value).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    #[inline]
    pub fn misses(&self) -> u64 {
        self.misses
    }
}

impl<K: Eq + Hash + Clone, V: Copy> Default for FrameCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_create_is_not_cached() {
        let mut cache: FrameCache<u32, u32> = FrameCache::new();

        assert_eq!(cache.get_or_try_insert_with(&1, || Err("boom")), Err("boom"));
        assert!(cache.is_empty());
        assert_eq!(cache.misses(), 0);

        assert_eq!(cache.get_or_try_insert_with(&1, || Ok::<_, &str>(5)), Ok(5));
        assert_eq!(cache.get(&1), Some(5));
    }

    #[test]
    fn test_drain_empties_cache() {
        let mut cache: FrameCache<u32, u32> = FrameCache::new();
        for i in 0..4 {
            cache.get_or_try_insert_with(&i, || Ok::<_, ()>(i * 10)).unwrap();
        }

        let mut drained = cache.drain();
        drained.sort_unstable();

        assert_eq!(drained, vec![0, 10, 20, 30]);
        assert!(cache.is_empty());
    }
}
