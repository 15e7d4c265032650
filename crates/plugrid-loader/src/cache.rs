//! Persistent plugin metadata cache.
//!
//! Caches normalized descriptors keyed by image path so repeated
//! discovery scans do not reopen every image. An entry is valid while the
//! file's mtime and size are unchanged and the entry is younger than the
//! TTL. The cache is capacity-capped; overflow evicts the entry with the
//! oldest cache time.
//!
//! The on-disk form is a small versioned binary file holding at most the
//! capacity's worth of most-recent entries. Read errors degrade silently
//! to a cold cache.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use plugrid_core::{PluginDescriptor, PluginResult};

/// On-disk cache format version.
const CACHE_FORMAT_VERSION: u32 = 1;

/// Default number of cached entries.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;
/// Default entry time-to-live.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

/// One cached metadata record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    metadata: PluginDescriptor,
    /// File mtime at caching, unix milliseconds.
    file_time: i64,
    file_size: u64,
    cache_time: DateTime<Utc>,
}

/// Cache hit/miss statistics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that fell through to the image.
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0 when no lookups occurred.
    pub hit_rate: f64,
}

/// TTL + LRU-capped metadata cache with binary persistence.
#[derive(Debug)]
pub struct MetadataCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| i64::try_from(d.as_millis()).ok())
        .unwrap_or(0)
}

impl MetadataCache {
    /// Create a cache with the given capacity and TTL.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a descriptor for `path`, validating the entry against the
    /// file's current mtime and size. Invalid entries are dropped.
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<PluginDescriptor> {
        let key = path.to_string_lossy().into_owned();
        let valid = {
            let entries = self.read_lock();
            entries.get(&key).is_some_and(|e| self.is_valid(path, e))
        };
        if valid {
            self.hits.fetch_add(1, Ordering::Relaxed);
            let entries = self.read_lock();
            return entries.get(&key).map(|e| e.metadata.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.write_lock();
        entries.remove(&key);
        None
    }

    /// Insert a freshly read descriptor for `path`.
    pub fn insert(&self, path: &Path, metadata: PluginDescriptor) {
        let Ok(file_meta) = std::fs::metadata(path) else {
            return;
        };
        let entry = CacheEntry {
            metadata,
            file_time: mtime_millis(&file_meta),
            file_size: file_meta.len(),
            cache_time: Utc::now(),
        };
        let key = path.to_string_lossy().into_owned();
        let mut entries = self.write_lock();
        entries.insert(key, entry);
        // Evict the oldest entry while over capacity. Linear scan is fine
        // at the configured cap.
        while entries.len() > self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.cache_time)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    debug!(key = %k, "Evicting oldest metadata cache entry");
                    entries.remove(&k);
                },
                None => break,
            }
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.write_lock().clear();
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_lock().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit/miss statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits.saturating_add(misses);
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        CacheStats {
            hits,
            misses,
            hit_rate,
        }
    }

    fn is_valid(&self, path: &Path, entry: &CacheEntry) -> bool {
        let Ok(meta) = std::fs::metadata(path) else {
            return false;
        };
        if mtime_millis(&meta) != entry.file_time || meta.len() != entry.file_size {
            return false;
        }
        let age = Utc::now().signed_duration_since(entry.cache_time);
        age.to_std().is_ok_and(|age| age < self.ttl)
    }

    // -----------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------

    /// Write the cache to `path`, keeping at most the capacity's worth of
    /// most-recent entries.
    pub fn save(&self, path: &Path) -> PluginResult<()> {
        let mut records: Vec<(String, CacheEntry)> = {
            let entries = self.read_lock();
            entries.iter().map(|(k, e)| (k.clone(), e.clone())).collect()
        };
        records.sort_by(|a, b| b.1.cache_time.cmp(&a.1.cache_time));
        records.truncate(self.capacity);

        let mut buf = Vec::new();
        buf.extend_from_slice(&CACHE_FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&u32::try_from(records.len()).unwrap_or(u32::MAX).to_le_bytes());
        for (key, entry) in &records {
            let metadata = serde_json::to_vec(&entry.metadata)?;
            write_bytes(&mut buf, key.as_bytes());
            buf.extend_from_slice(&entry.file_size.to_le_bytes());
            buf.extend_from_slice(&entry.file_time.to_le_bytes());
            buf.extend_from_slice(&entry.cache_time.timestamp_millis().to_le_bytes());
            write_bytes(&mut buf, &metadata);
        }

        let mut file = std::fs::File::create(path)?;
        file.write_all(&buf)?;
        file.flush()?;
        debug!(path = %path.display(), entries = records.len(), "Saved metadata cache");
        Ok(())
    }

    /// Load entries from `path`. Read and parse failures degrade silently
    /// to a cold cache; a truncated file yields the records read so far.
    /// Returns the number of entries loaded.
    pub fn load(&self, path: &Path) -> usize {
        let Ok(data) = std::fs::read(path) else {
            return 0;
        };
        let mut cursor = std::io::Cursor::new(data);

        let Some(version) = read_u32(&mut cursor) else {
            return 0;
        };
        if version != CACHE_FORMAT_VERSION {
            warn!(version, "Ignoring metadata cache with unknown version");
            return 0;
        }
        let Some(count) = read_u32(&mut cursor) else {
            return 0;
        };

        let mut loaded = 0usize;
        let mut entries = self.write_lock();
        for _ in 0..count {
            let Some(record) = read_record(&mut cursor) else {
                break; // truncated; keep what we have
            };
            entries.insert(record.0, record.1);
            loaded = loaded.saturating_add(1);
        }
        debug!(path = %path.display(), loaded, "Loaded metadata cache");
        loaded
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&u32::try_from(bytes.len()).unwrap_or(u32::MAX).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn read_u32(cursor: &mut std::io::Cursor<Vec<u8>>) -> Option<u32> {
    let mut b = [0u8; 4];
    cursor.read_exact(&mut b).ok()?;
    Some(u32::from_le_bytes(b))
}

fn read_u64(cursor: &mut std::io::Cursor<Vec<u8>>) -> Option<u64> {
    let mut b = [0u8; 8];
    cursor.read_exact(&mut b).ok()?;
    Some(u64::from_le_bytes(b))
}

fn read_i64(cursor: &mut std::io::Cursor<Vec<u8>>) -> Option<i64> {
    let mut b = [0u8; 8];
    cursor.read_exact(&mut b).ok()?;
    Some(i64::from_le_bytes(b))
}

fn read_blob(cursor: &mut std::io::Cursor<Vec<u8>>) -> Option<Vec<u8>> {
    let len = read_u32(cursor)? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).ok()?;
    Some(buf)
}

fn read_record(cursor: &mut std::io::Cursor<Vec<u8>>) -> Option<(String, CacheEntry)> {
    let key = String::from_utf8(read_blob(cursor)?).ok()?;
    let file_size = read_u64(cursor)?;
    let file_time = read_i64(cursor)?;
    let cache_millis = read_i64(cursor)?;
    let metadata: PluginDescriptor = serde_json::from_slice(&read_blob(cursor)?).ok()?;
    let cache_time = DateTime::<Utc>::from_timestamp_millis(cache_millis)?;
    Some((
        key,
        CacheEntry {
            metadata,
            file_time,
            file_size,
            cache_time,
        },
    ))
}

/// Spawn a background task that saves the cache to `path` on an interval
/// until the returned guard is dropped.
pub fn spawn_periodic_save(
    cache: std::sync::Arc<MetadataCache>,
    path: std::path::PathBuf,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = cache.save(&path) {
                warn!(error = %e, "Periodic metadata cache save failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugrid_core::Version;

    fn descriptor(id: &str) -> PluginDescriptor {
        PluginDescriptor::minimal(id, id, Version::new(1, 0, 0)).unwrap()
    }

    fn touch(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn hit_after_insert() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(dir.path(), "a.so", b"image");
        let cache = MetadataCache::default();

        assert!(cache.get(&path).is_none());
        cache.insert(&path, descriptor("a"));
        let got = cache.get(&path).unwrap();
        assert_eq!(got.id.as_str(), "a");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn size_change_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(dir.path(), "a.so", b"image");
        let cache = MetadataCache::default();
        cache.insert(&path, descriptor("a"));

        // Rewrite the file with different contents (different size).
        touch(dir.path(), "a.so", b"image-grew");
        assert!(cache.get(&path).is_none());
        assert!(cache.is_empty(), "stale entry should be dropped");
    }

    #[test]
    fn ttl_expiry_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(dir.path(), "a.so", b"image");
        let cache = MetadataCache::new(8, Duration::ZERO);
        cache.insert(&path, descriptor("a"));
        assert!(cache.get(&path).is_none());
    }

    #[test]
    fn missing_file_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(dir.path(), "a.so", b"image");
        let cache = MetadataCache::default();
        cache.insert(&path, descriptor("a"));
        std::fs::remove_file(&path).unwrap();
        assert!(cache.get(&path).is_none());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetadataCache::new(2, DEFAULT_CACHE_TTL);

        let a = touch(dir.path(), "a.so", b"a");
        let b = touch(dir.path(), "b.so", b"b");
        let c = touch(dir.path(), "c.so", b"c");

        cache.insert(&a, descriptor("a"));
        std::thread::sleep(Duration::from_millis(5));
        cache.insert(&b, descriptor("b"));
        std::thread::sleep(Duration::from_millis(5));
        cache.insert(&c, descriptor("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a).is_none(), "oldest entry should be evicted");
        assert!(cache.get(&b).is_some());
        assert!(cache.get(&c).is_some());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let image = touch(dir.path(), "a.so", b"image");
        let cache_file = dir.path().join("metadata.cache");

        let cache = MetadataCache::default();
        cache.insert(&image, descriptor("a"));
        cache.save(&cache_file).unwrap();

        let fresh = MetadataCache::default();
        assert_eq!(fresh.load(&cache_file), 1);
        assert_eq!(fresh.get(&image).unwrap().id.as_str(), "a");
    }

    #[test]
    fn load_tolerates_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let image = touch(dir.path(), "a.so", b"image");
        let cache_file = dir.path().join("metadata.cache");

        let cache = MetadataCache::default();
        cache.insert(&image, descriptor("a"));
        cache.insert(&touch(dir.path(), "b.so", b"image2"), descriptor("b"));
        cache.save(&cache_file).unwrap();

        // Chop the tail off the file.
        let data = std::fs::read(&cache_file).unwrap();
        std::fs::write(&cache_file, &data[..data.len() - 10]).unwrap();

        let fresh = MetadataCache::default();
        // One full record survives; the truncated one is skipped.
        assert_eq!(fresh.load(&cache_file), 1);
    }

    #[test]
    fn load_ignores_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("metadata.cache");
        std::fs::write(&cache_file, 99u32.to_le_bytes()).unwrap();

        let cache = MetadataCache::default();
        assert_eq!(cache.load(&cache_file), 0);
    }

    #[test]
    fn load_missing_file_is_cold_cache() {
        let cache = MetadataCache::default();
        assert_eq!(cache.load(Path::new("/nonexistent/cache.bin")), 0);
    }
}
