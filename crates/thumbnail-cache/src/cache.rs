//! Content-addressed thumbnail store: in-memory hot tier plus disk directory
//!
//! Every entry is a single `<key>.jpg` file in the cache directory; the file
//! existing *is* the entry. Reads and writes are best-effort: an I/O error on
//! `get` is a miss and a failed `put` is logged and dropped, so the cache can
//! never fail the request that produced the bytes.
//!
//! There is no locking per key. Two workers missing on the same key both
//! build and both write; each write lands through a temp file and an atomic
//! rename, so readers see one complete file or the other and the last rename
//! wins. Thumbnails for a key are interchangeable, so this is harmless.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::lru::LruCache;
use crate::CacheKey;

const ENTRY_EXTENSION: &str = "jpg";

pub struct CacheStore {
    cache_dir: PathBuf,
    memory: Option<LruCache<CacheKey, Vec<u8>>>,
    /// Last-access index of the disk entries, only kept when a disk budget is set
    disk_index: Option<LruCache<CacheKey, ()>>,
    disk_budget: Option<u64>,
}

impl CacheStore {
    /// Open (creating if needed) a store rooted at `cache_dir`
    pub fn open(cache_dir: impl Into<PathBuf>, memory_budget: usize, disk_budget: Option<u64>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("Failed to create cache directory: {}", cache_dir.display()))?;

        let memory = (memory_budget > 0).then(|| LruCache::new(memory_budget));
        let disk_index = disk_budget.map(|budget| LruCache::new(usize::try_from(budget).unwrap_or(usize::MAX)));

        let store = Self {
            cache_dir,
            memory,
            disk_index,
            disk_budget,
        };
        store.rebuild_disk_index();
        Ok(store)
    }

    /// Open the store in the per-user cache directory, falling back to the
    /// system temp directory when that cannot be created
    pub fn open_default(memory_budget: usize, disk_budget: Option<u64>) -> Result<Self> {
        match Self::open(Self::default_cache_dir(), memory_budget, disk_budget) {
            Ok(store) => Ok(store),
            Err(e) => {
                warn!(error = %e, "falling back to temp directory for thumbnail cache");
                Self::open(Self::fallback_cache_dir(), memory_budget, disk_budget)
            }
        }
    }

    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .map(|dir| dir.join("image-viewer-pro").join("thumbnails"))
            .unwrap_or_else(Self::fallback_cache_dir)
    }

    fn fallback_cache_dir() -> PathBuf {
        std::env::temp_dir().join("image-viewer-pro-thumbnails")
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path of the disk entry for a key, whether or not it exists
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", key.to_hex(), ENTRY_EXTENSION))
    }

    /// Get cached bytes (memory first, then disk)
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        if let Some(data) = self.memory.as_ref().and_then(|memory| memory.get(key)) {
            // Hot-tier hits still count as accesses for disk eviction
            if let Some(index) = &self.disk_index {
                index.touch(key);
            }
            return Some(data);
        }

        let path = self.entry_path(key);
        match fs::read(&path) {
            Ok(data) => {
                self.record_disk_access(key, data.len());
                if let Some(memory) = &self.memory {
                    memory.insert(*key, data.clone(), data.len());
                }
                Some(data)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Store bytes in both tiers. Returns whether the disk write succeeded.
    pub fn put(&self, key: &CacheKey, data: &[u8]) -> bool {
        if let Some(memory) = &self.memory {
            memory.insert(*key, data.to_vec(), data.len());
        }

        match self.write_entry(key, data) {
            Ok(()) => {
                if let Some(index) = &self.disk_index {
                    let evicted = index.insert(*key, (), data.len());
                    self.remove_evicted(evicted);
                }
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "failed to write cache entry");
                false
            }
        }
    }

    /// Drop an entry from both tiers, e.g. after its bytes failed to parse
    pub fn invalidate(&self, key: &CacheKey) {
        if let Some(memory) = &self.memory {
            memory.remove(key);
        }
        if let Some(index) = &self.disk_index {
            index.remove(key);
        }
        remove_file_quietly(&self.entry_path(key));
    }

    fn write_entry(&self, key: &CacheKey, data: &[u8]) -> io::Result<()> {
        // The directory may have been removed underneath us
        fs::create_dir_all(&self.cache_dir)?;

        let mut file = NamedTempFile::new_in(&self.cache_dir)?;
        file.write_all(data)?;
        file.persist(self.entry_path(key)).map_err(|e| e.error)?;
        Ok(())
    }

    fn record_disk_access(&self, key: &CacheKey, size: usize) {
        if let Some(index) = &self.disk_index {
            if !index.touch(key) {
                let evicted = index.insert(*key, (), size);
                self.remove_evicted(evicted);
            }
        }
    }

    fn remove_evicted(&self, evicted: Vec<(CacheKey, ())>) {
        for (key, ()) in evicted {
            debug!(key = %key, "evicting cache entry");
            if let Some(memory) = &self.memory {
                memory.remove(&key);
            }
            remove_file_quietly(&self.entry_path(&key));
        }
    }

    /// Seed the disk index from the files already on disk, oldest first, and
    /// drop whatever no longer fits the budget
    fn rebuild_disk_index(&self) {
        let Some(index) = &self.disk_index else {
            return;
        };

        let mut entries: Vec<(CacheKey, u64, SystemTime)> = self
            .disk_entries()
            .into_iter()
            .filter_map(|(path, metadata)| {
                let key = path.file_stem().and_then(|s| s.to_str()).and_then(CacheKey::from_hex)?;
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((key, metadata.len(), modified))
            })
            .collect();
        entries.sort_by_key(|(_, _, modified)| *modified);

        for (key, size, _) in entries {
            let evicted = index.insert(key, (), usize::try_from(size).unwrap_or(usize::MAX));
            self.remove_evicted(evicted);
        }
    }

    /// Files in the cache directory that look like cache entries
    fn disk_entries(&self) -> Vec<(PathBuf, fs::Metadata)> {
        let Ok(read_dir) = fs::read_dir(&self.cache_dir) else {
            return Vec::new();
        };

        read_dir
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                let is_entry = path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION);
                let metadata = entry.metadata().ok()?;
                (is_entry && metadata.is_file()).then_some((path, metadata))
            })
            .collect()
    }

    /// Get cache statistics, scanning the directory for the disk figures
    pub fn stats(&self) -> CacheStats {
        let entries = self.disk_entries();
        CacheStats {
            cache_dir: self.cache_dir.clone(),
            disk_entries: entries.len(),
            disk_bytes: entries.iter().map(|(_, metadata)| metadata.len()).sum(),
            disk_budget: self.disk_budget,
            memory_items: self.memory.as_ref().map_or(0, |m| m.len()),
            memory_bytes: self.memory.as_ref().map_or(0, |m| m.total_bytes()),
            memory_max_bytes: self.memory.as_ref().map_or(0, |m| m.max_bytes()),
        }
    }

    /// Clear both tiers. Only cache entry files are removed from the directory.
    pub fn clear(&self) -> Result<usize> {
        if let Some(memory) = &self.memory {
            memory.clear();
        }
        if let Some(index) = &self.disk_index {
            index.clear();
        }

        let mut removed = 0;
        for (path, _) in self.disk_entries() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove cache file: {}", path.display()))?;
            removed += 1;
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("cache_dir", &self.cache_dir)
            .field("memory", &self.memory)
            .field("disk_budget", &self.disk_budget)
            .finish()
    }
}

fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "failed to remove cache file");
        }
    }
}

/// Cache statistics for monitoring and debugging
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cache_dir: PathBuf,
    pub disk_entries: usize,
    pub disk_bytes: u64,
    pub disk_budget: Option<u64>,
    pub memory_items: usize,
    pub memory_bytes: usize,
    pub memory_max_bytes: usize,
}

impl CacheStats {
    pub fn memory_usage_percent(&self) -> f64 {
        if self.memory_max_bytes == 0 {
            0.0
        } else {
            (self.memory_bytes as f64 / self.memory_max_bytes as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn key(name: &str) -> CacheKey {
        CacheKey::from_parts(Path::new(name), 200, None)
    }

    #[test]
    fn test_cache_creation() -> Result<()> {
        let temp_dir = tempdir()?;
        let cache_dir = temp_dir.path().join("nested").join("thumbs");

        let store = CacheStore::open(&cache_dir, 1024, None)?;
        assert!(cache_dir.is_dir());
        assert_eq!(store.cache_dir(), cache_dir.as_path());

        let entry = store.entry_path(&key("a.png"));
        assert!(entry.starts_with(&cache_dir));
        assert!(entry.to_string_lossy().ends_with(".jpg"));
        Ok(())
    }

    #[test]
    fn test_put_then_get_round_trip() -> Result<()> {
        let temp_dir = tempdir()?;
        let store = CacheStore::open(temp_dir.path(), 1024, None)?;

        assert_eq!(store.get(&key("a.png")), None);
        assert!(store.put(&key("a.png"), b"jpeg bytes"));
        assert_eq!(store.get(&key("a.png")), Some(b"jpeg bytes".to_vec()));
        assert_eq!(fs::read(store.entry_path(&key("a.png")))?, b"jpeg bytes");
        Ok(())
    }

    #[test]
    fn test_disk_tier_survives_reopen() -> Result<()> {
        let temp_dir = tempdir()?;
        CacheStore::open(temp_dir.path(), 0, None)?.put(&key("a.png"), b"persisted");

        let reopened = CacheStore::open(temp_dir.path(), 0, None)?;
        assert_eq!(reopened.get(&key("a.png")), Some(b"persisted".to_vec()));
        Ok(())
    }

    #[test]
    fn test_read_errors_are_misses() -> Result<()> {
        let temp_dir = tempdir()?;
        let store = CacheStore::open(temp_dir.path(), 0, None)?;

        // A directory where the entry file should be makes the read fail
        fs::create_dir(store.entry_path(&key("a.png")))?;
        assert_eq!(store.get(&key("a.png")), None);
        Ok(())
    }

    #[test]
    fn test_failed_write_is_ignored() -> Result<()> {
        let temp_dir = tempdir()?;
        let store = CacheStore::open(temp_dir.path(), 0, None)?;

        // Renaming onto a non-empty directory fails
        let blocked = store.entry_path(&key("a.png"));
        fs::create_dir(&blocked)?;
        fs::write(blocked.join("occupied"), b"x")?;

        assert!(!store.put(&key("a.png"), b"bytes"));
        assert_eq!(store.get(&key("a.png")), None);
        Ok(())
    }

    #[test]
    fn test_concurrent_writers_same_key() -> Result<()> {
        let temp_dir = tempdir()?;
        let store = Arc::new(CacheStore::open(temp_dir.path(), 0, None)?);
        let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 4096]).collect();

        let handles: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|payload| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.put(&key("same.png"), &payload))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }

        // Exactly one complete payload is on disk, and no temp files are left
        let stored = store.get(&key("same.png")).unwrap();
        assert!(payloads.contains(&stored));
        assert_eq!(store.stats().disk_entries, 1);
        assert_eq!(fs::read_dir(temp_dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_disk_budget_evicts_least_recently_used() -> Result<()> {
        let temp_dir = tempdir()?;
        let store = CacheStore::open(temp_dir.path(), 0, Some(25))?;

        store.put(&key("a"), &[1; 10]);
        store.put(&key("b"), &[2; 10]);
        // Reading `a` makes `b` the eviction candidate
        assert!(store.get(&key("a")).is_some());
        store.put(&key("c"), &[3; 10]);

        assert!(store.entry_path(&key("a")).exists());
        assert!(!store.entry_path(&key("b")).exists());
        assert!(store.entry_path(&key("c")).exists());
        assert_eq!(store.stats().disk_bytes, 20);
        Ok(())
    }

    #[test]
    fn test_disk_budget_counts_memory_hits() -> Result<()> {
        let temp_dir = tempdir()?;
        let store = CacheStore::open(temp_dir.path(), 1024, Some(25))?;

        store.put(&key("a"), &[1; 10]);
        store.put(&key("b"), &[2; 10]);
        // Served from the hot tier, but still the most recent access
        assert_eq!(store.get(&key("a")), Some(vec![1; 10]));
        store.put(&key("c"), &[3; 10]);

        assert!(store.entry_path(&key("a")).exists());
        assert!(!store.entry_path(&key("b")).exists());
        assert!(store.entry_path(&key("c")).exists());
        assert_eq!(store.get(&key("a")), Some(vec![1; 10]));
        assert_eq!(store.get(&key("b")), None);
        Ok(())
    }

    #[test]
    fn test_disk_budget_applies_to_existing_entries() -> Result<()> {
        let temp_dir = tempdir()?;
        {
            let unbounded = CacheStore::open(temp_dir.path(), 0, None)?;
            for name in ["a", "b", "c", "d"] {
                unbounded.put(&key(name), &[0; 10]);
            }
        }

        let bounded = CacheStore::open(temp_dir.path(), 0, Some(20))?;
        assert_eq!(bounded.stats().disk_entries, 2);
        Ok(())
    }

    #[test]
    fn test_stats_and_clear() -> Result<()> {
        let temp_dir = tempdir()?;
        let store = CacheStore::open(temp_dir.path(), 1000, None)?;
        fs::write(temp_dir.path().join("notes.txt"), b"not an entry")?;

        store.put(&key("a"), &[0; 100]);
        store.put(&key("b"), &[0; 50]);

        let stats = store.stats();
        assert_eq!(stats.disk_entries, 2);
        assert_eq!(stats.disk_bytes, 150);
        assert_eq!(stats.memory_items, 2);
        assert_eq!(stats.memory_bytes, 150);
        assert!((stats.memory_usage_percent() - 15.0).abs() < 1e-9);

        assert_eq!(store.clear()?, 2);
        let stats = store.stats();
        assert_eq!(stats.disk_entries, 0);
        assert_eq!(stats.memory_items, 0);
        assert!(temp_dir.path().join("notes.txt").exists());
        Ok(())
    }

    #[test]
    fn test_invalidate() -> Result<()> {
        let temp_dir = tempdir()?;
        let store = CacheStore::open(temp_dir.path(), 1000, None)?;

        store.put(&key("a"), b"bytes");
        store.invalidate(&key("a"));
        assert_eq!(store.get(&key("a")), None);
        assert!(!store.entry_path(&key("a")).exists());
        Ok(())
    }
}
