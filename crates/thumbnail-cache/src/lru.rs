//! Thread-safe LRU cache with byte budget management
//!
//! Tracks both the number of entries and the total bytes they account for,
//! evicting least-recently-used entries once the byte budget is exceeded.
//! Evicted entries are handed back to the caller so it can release whatever
//! they stand for (the disk tier deletes the matching files).

use parking_lot::Mutex;
use std::fmt;
use std::hash::Hash;

/// A thread-safe LRU cache with a byte budget
pub struct LruCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K: Hash + Eq, V> {
    entries: lru::LruCache<K, (V, usize)>,
    total_bytes: usize,
    max_bytes: usize,
}

impl<K: Hash + Eq, V: Clone> LruCache<K, V> {
    /// Create a new LRU cache with the specified byte budget
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: lru::LruCache::unbounded(),
                total_bytes: 0,
                max_bytes,
            }),
        }
    }

    /// Get a value, marking it most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.entries.get(key).map(|(value, _)| value.clone())
    }

    /// Mark an entry most recently used without cloning its value
    pub fn touch(&self, key: &K) -> bool {
        self.inner.lock().entries.promote(key);
        self.contains(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Insert a value accounting for `byte_size` bytes and return whatever had
    /// to be evicted to get back under budget. A value larger than the whole
    /// budget is not kept and comes straight back in the evicted list.
    pub fn insert(&self, key: K, value: V, byte_size: usize) -> Vec<(K, V)> {
        let mut inner = self.inner.lock();

        if let Some((_, old_size)) = inner.entries.put(key, (value, byte_size)) {
            inner.total_bytes = inner.total_bytes.saturating_sub(old_size);
        }
        inner.total_bytes = inner.total_bytes.saturating_add(byte_size);

        let mut evicted = Vec::new();
        while inner.total_bytes > inner.max_bytes {
            match inner.entries.pop_lru() {
                Some((key, (value, size))) => {
                    inner.total_bytes = inner.total_bytes.saturating_sub(size);
                    evicted.push((key, value));
                }
                None => break,
            }
        }
        evicted
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let (value, size) = inner.entries.pop(key)?;
        inner.total_bytes = inner.total_bytes.saturating_sub(size);
        Some(value)
    }

    /// Get the current total bytes stored in the cache
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    /// Get the maximum byte budget
    pub fn max_bytes(&self) -> usize {
        self.inner.lock().max_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all items from the cache
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }
}

impl<K: Hash + Eq, V> fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LruCache")
            .field("len", &inner.entries.len())
            .field("total_bytes", &inner.total_bytes)
            .field("max_bytes", &inner.max_bytes)
            .finish()
    }
}
