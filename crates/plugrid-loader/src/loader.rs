//! The plugin loader.
//!
//! Owns every loaded native image and the shared plugin instances backed
//! by them. Loading never mutates the loaded set on failure; unloading
//! drops the instance before the image so the image always outlives its
//! aliases.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use plugrid_core::{
    ErrorKind, PluginDescriptor, PluginError, PluginHandle, PluginId, PluginResult,
};

use crate::cache::{CacheStats, MetadataCache};
use crate::image::{DylibBackend, ImageBackend, ImageHandle, has_image_extension};

/// Batches at or below this size load sequentially.
const SEQUENTIAL_BATCH_MAX: usize = 3;
/// Ring buffer capacity for the error report.
const ERROR_REPORT_CAP: usize = 100;
/// Default per-item timeout for batch operations.
const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(30);

/// One entry in the loader's error report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// When the error occurred.
    pub timestamp: DateTime<Utc>,
    /// The loader operation that failed.
    pub operation: String,
    /// Error classification.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
}

/// Point-in-time resource usage for a loaded plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// The plugin.
    pub id: PluginId,
    /// Image path.
    pub path: PathBuf,
    /// When the plugin was loaded.
    pub load_time: DateTime<Utc>,
    /// Estimated resident memory, derived from the image size.
    pub estimated_memory_bytes: u64,
    /// Outstanding shared handles to the instance (including the
    /// loader's own).
    pub ref_count: usize,
}

/// Statistics for the batch worker pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolStats {
    /// Upper bound on concurrent batch tasks.
    pub max_parallelism: usize,
    /// Batches executed.
    pub batches: u64,
    /// Individual tasks executed.
    pub tasks: u64,
    /// Tasks that exceeded the per-item timeout.
    pub timeouts: u64,
}

/// A loaded plugin as reported by [`PluginLoader::loaded_plugins`].
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    /// The plugin.
    pub id: PluginId,
    /// Image path.
    pub path: PathBuf,
    /// When the plugin was loaded.
    pub load_time: DateTime<Utc>,
    /// Shared instance handle.
    pub instance: PluginHandle,
}

/// Field order matters: the instance aliases storage owned by the image,
/// so it must drop first.
struct LoadedEntry {
    instance: PluginHandle,
    _image: Box<dyn ImageHandle>,
    path: PathBuf,
    load_time: DateTime<Utc>,
    estimated_memory: u64,
}

struct LoaderInner {
    backends: Vec<Arc<dyn ImageBackend>>,
    loaded: RwLock<HashMap<PluginId, LoadedEntry>>,
    cache: Arc<MetadataCache>,
    errors: Mutex<VecDeque<ErrorRecord>>,
    max_parallelism: usize,
    item_timeout: Duration,
    batches: AtomicU64,
    tasks: AtomicU64,
    timeouts: AtomicU64,
}

/// The plugin loader. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct PluginLoader {
    inner: Arc<LoaderInner>,
}

impl PluginLoader {
    /// Create a loader with the default dylib backend and cache.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start building a loader.
    #[must_use]
    pub fn builder() -> PluginLoaderBuilder {
        PluginLoaderBuilder::default()
    }

    /// The metadata cache shared by this loader.
    #[must_use]
    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.inner.cache
    }

    // -----------------------------------------------------------------
    // Discovery & metadata
    // -----------------------------------------------------------------

    /// Scan a directory for candidate plugin images.
    ///
    /// Returns paths with an accepted extension, sorted for determinism.
    /// Non-recursive scans look only at the directory's direct children.
    #[must_use]
    pub fn discover(&self, dir: &Path, recursive: bool) -> Vec<PathBuf> {
        let walker = if recursive {
            walkdir::WalkDir::new(dir)
        } else {
            walkdir::WalkDir::new(dir).max_depth(1)
        };
        let mut paths: Vec<PathBuf> = walker
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .filter(|p| has_image_extension(p))
            .collect();
        paths.sort();
        paths
    }

    /// Whether `path` can host a plugin: it exists, carries an accepted
    /// extension, and its metadata parses.
    #[must_use]
    pub fn can_load(&self, path: &Path) -> bool {
        path.is_file() && has_image_extension(path) && self.read_metadata(path).is_ok()
    }

    /// Read (or fetch from cache) the normalized metadata for an image.
    pub fn read_metadata(&self, path: &Path) -> PluginResult<PluginDescriptor> {
        if let Some(descriptor) = self.inner.cache.get(path) {
            return Ok(descriptor);
        }
        let descriptor = self
            .read_metadata_fresh(path)
            .inspect_err(|e| self.record_error("read_metadata", e))?;
        self.inner.cache.insert(path, descriptor.clone());
        Ok(descriptor)
    }

    fn read_metadata_fresh(&self, path: &Path) -> PluginResult<PluginDescriptor> {
        let backend = self.backend_for(path)?;
        let image = backend.open(path)?;
        let raw = image.metadata()?;
        PluginDescriptor::from_document(&raw, image.interface_id().as_deref())
    }

    // -----------------------------------------------------------------
    // Load / unload
    // -----------------------------------------------------------------

    /// Load the plugin image at `path` and return a shared instance.
    ///
    /// # Errors
    ///
    /// `FileNotFound` if the path does not name a file, `InvalidFormat`
    /// if no backend accepts it or its metadata is malformed,
    /// `AlreadyExists` if a plugin with the same ID is loaded, and
    /// `LoadFailed` if the image cannot be opened or instantiated.
    pub fn load(&self, path: &Path) -> PluginResult<PluginHandle> {
        self.load_impl(path)
            .inspect_err(|e| self.record_error("load", e))
    }

    fn load_impl(&self, path: &Path) -> PluginResult<PluginHandle> {
        if !path.is_file() {
            return Err(PluginError::file_not_found(path.display()));
        }
        let backend = self.backend_for(path)?;
        let image = backend.open(path)?;
        let raw = image.metadata()?;
        let descriptor = PluginDescriptor::from_document(&raw, image.interface_id().as_deref())?;
        let id = descriptor.id.clone();

        if self.is_loaded(&id) {
            return Err(PluginError::already_exists(&id));
        }
        self.inner.cache.insert(path, descriptor);

        let instance = image.instantiate()?;
        let estimated_memory = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let entry = LoadedEntry {
            instance: Arc::clone(&instance),
            _image: image,
            path: path.to_path_buf(),
            load_time: Utc::now(),
            estimated_memory,
        };

        let mut loaded = write_lock(&self.inner.loaded);
        // Re-check under the write lock; a concurrent load may have won.
        if loaded.contains_key(&id) {
            return Err(PluginError::already_exists(&id));
        }
        loaded.insert(id.clone(), entry);
        drop(loaded);

        info!(plugin_id = %id, path = %path.display(), "Loaded plugin");
        Ok(instance)
    }

    /// Unload a plugin, releasing its native image.
    ///
    /// Callers holding instance handles must drop them; the aliases are
    /// revoked logically once the loader entry is gone.
    pub fn unload(&self, id: &PluginId) -> PluginResult<()> {
        let entry = {
            let mut loaded = write_lock(&self.inner.loaded);
            loaded.remove(id)
        };
        match entry {
            Some(entry) => {
                let outstanding = Arc::strong_count(&entry.instance).saturating_sub(1);
                if outstanding > 1 {
                    debug!(
                        plugin_id = %id,
                        outstanding,
                        "Unloading plugin with outstanding instance handles"
                    );
                }
                drop(entry); // instance first, then image
                info!(plugin_id = %id, "Unloaded plugin");
                Ok(())
            },
            None => {
                let err = PluginError::not_found(id);
                self.record_error("unload", &err);
                Err(err)
            },
        }
    }

    /// Concurrently unload every loaded plugin, joining all unloads.
    pub async fn unload_all(&self) {
        let ids = self.loaded_plugin_ids();
        if ids.is_empty() {
            return;
        }
        let mut set = JoinSet::new();
        for id in ids {
            let loader = self.clone();
            set.spawn_blocking(move || {
                if let Err(e) = loader.unload(&id) {
                    warn!(plugin_id = %id, error = %e, "Unload during shutdown failed");
                }
            });
        }
        while set.join_next().await.is_some() {}
    }

    // -----------------------------------------------------------------
    // Batch operations
    // -----------------------------------------------------------------

    /// Load several images, returning per-item results in input order.
    ///
    /// Small batches run sequentially; larger ones run on a bounded
    /// worker pool with a per-item timeout. A timed-out item reports
    /// `Timeout` but its task is left to complete off-band.
    pub async fn batch_load(&self, paths: &[PathBuf]) -> Vec<PluginResult<PluginHandle>> {
        self.inner.batches.fetch_add(1, Ordering::Relaxed);
        if paths.len() <= SEQUENTIAL_BATCH_MAX {
            return paths
                .iter()
                .map(|p| {
                    self.inner.tasks.fetch_add(1, Ordering::Relaxed);
                    self.load(p)
                })
                .collect();
        }
        self.run_batch(paths.to_vec(), |loader, path| loader.load(&path))
            .await
    }

    /// Unload several plugins, returning per-item results in input order.
    pub async fn batch_unload(&self, ids: &[PluginId]) -> Vec<PluginResult<()>> {
        self.inner.batches.fetch_add(1, Ordering::Relaxed);
        if ids.len() <= SEQUENTIAL_BATCH_MAX {
            return ids
                .iter()
                .map(|id| {
                    self.inner.tasks.fetch_add(1, Ordering::Relaxed);
                    self.unload(id)
                })
                .collect();
        }
        self.run_batch(ids.to_vec(), |loader, id| loader.unload(&id))
            .await
    }

    async fn run_batch<I, T, F>(&self, items: Vec<I>, op: F) -> Vec<PluginResult<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(PluginLoader, I) -> PluginResult<T> + Send + Sync + Copy + 'static,
    {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.inner.max_parallelism));
        let mut set: JoinSet<(usize, PluginResult<T>)> = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let loader = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let item_timeout = self.inner.item_timeout;
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                loader.inner.tasks.fetch_add(1, Ordering::Relaxed);
                let worker = {
                    let loader = loader.clone();
                    tokio::task::spawn_blocking(move || op(loader, item))
                };
                match tokio::time::timeout(item_timeout, worker).await {
                    Ok(Ok(result)) => (index, result),
                    Ok(Err(join_err)) => (
                        index,
                        Err(PluginError::internal(format!("batch task failed: {join_err}"))),
                    ),
                    Err(_) => {
                        // The blocking task keeps running off-band.
                        loader.inner.timeouts.fetch_add(1, Ordering::Relaxed);
                        (
                            index,
                            Err(PluginError::timeout("batch item exceeded its deadline")),
                        )
                    },
                }
            });
        }

        let mut slots: Vec<Option<PluginResult<T>>> = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok((index, result)) = joined {
                if slots.len() <= index {
                    slots.resize_with(index.saturating_add(1), || None);
                }
                slots[index] = Some(result);
            }
        }
        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| Err(PluginError::internal("batch task vanished")))
            })
            .collect()
    }

    // -----------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------

    /// IDs of every loaded plugin.
    #[must_use]
    pub fn loaded_plugin_ids(&self) -> Vec<PluginId> {
        read_lock(&self.inner.loaded).keys().cloned().collect()
    }

    /// Every loaded plugin with its handle.
    #[must_use]
    pub fn loaded_plugins(&self) -> Vec<LoadedPlugin> {
        read_lock(&self.inner.loaded)
            .iter()
            .map(|(id, entry)| LoadedPlugin {
                id: id.clone(),
                path: entry.path.clone(),
                load_time: entry.load_time,
                instance: Arc::clone(&entry.instance),
            })
            .collect()
    }

    /// Whether a plugin is loaded.
    #[must_use]
    pub fn is_loaded(&self, id: &PluginId) -> bool {
        read_lock(&self.inner.loaded).contains_key(id)
    }

    /// Number of loaded plugins.
    #[must_use]
    pub fn loaded_plugin_count(&self) -> usize {
        read_lock(&self.inner.loaded).len()
    }

    /// Shared handle to a loaded plugin instance.
    #[must_use]
    pub fn plugin(&self, id: &PluginId) -> Option<PluginHandle> {
        read_lock(&self.inner.loaded)
            .get(id)
            .map(|e| Arc::clone(&e.instance))
    }

    /// Resource usage estimate for a loaded plugin.
    #[must_use]
    pub fn resource_usage(&self, id: &PluginId) -> Option<ResourceUsage> {
        read_lock(&self.inner.loaded).get(id).map(|entry| ResourceUsage {
            id: id.clone(),
            path: entry.path.clone(),
            load_time: entry.load_time,
            estimated_memory_bytes: entry.estimated_memory,
            ref_count: Arc::strong_count(&entry.instance),
        })
    }

    /// The last 100 loader errors, oldest first.
    #[must_use]
    pub fn error_report(&self) -> Vec<ErrorRecord> {
        lock(&self.inner.errors).iter().cloned().collect()
    }

    /// Drop the error report.
    pub fn clear_error_report(&self) {
        lock(&self.inner.errors).clear();
    }

    /// Cache hit/miss statistics.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Batch worker pool statistics.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            max_parallelism: self.inner.max_parallelism,
            batches: self.inner.batches.load(Ordering::Relaxed),
            tasks: self.inner.tasks.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
        }
    }

    fn backend_for(&self, path: &Path) -> PluginResult<&Arc<dyn ImageBackend>> {
        self.inner
            .backends
            .iter()
            .find(|b| b.can_open(path))
            .ok_or_else(|| {
                PluginError::invalid_format(format!(
                    "no backend accepts {}",
                    path.display()
                ))
            })
    }

    fn record_error(&self, operation: &str, error: &PluginError) {
        let mut errors = lock(&self.inner.errors);
        if errors.len() >= ERROR_REPORT_CAP {
            errors.pop_front();
        }
        errors.push_back(ErrorRecord {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("loaded", &self.loaded_plugin_count())
            .field("cache_entries", &self.inner.cache.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`PluginLoader`].
pub struct PluginLoaderBuilder {
    backends: Vec<Arc<dyn ImageBackend>>,
    cache: Option<Arc<MetadataCache>>,
    max_parallelism: usize,
    item_timeout: Duration,
}

impl Default for PluginLoaderBuilder {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            cache: None,
            max_parallelism: std::thread::available_parallelism().map_or(4, usize::from),
            item_timeout: DEFAULT_ITEM_TIMEOUT,
        }
    }
}

impl PluginLoaderBuilder {
    /// Add an image backend. Backends are tried in insertion order.
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn ImageBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Use a specific metadata cache.
    #[must_use]
    pub fn cache(mut self, cache: Arc<MetadataCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Cap batch parallelism (clamped to hardware concurrency).
    #[must_use]
    pub fn max_parallelism(mut self, n: usize) -> Self {
        let hw = std::thread::available_parallelism().map_or(4, usize::from);
        self.max_parallelism = n.clamp(1, hw);
        self
    }

    /// Per-item timeout for batch operations.
    #[must_use]
    pub fn item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    /// Finish building. With no explicit backends the dylib backend is
    /// installed.
    #[must_use]
    pub fn build(mut self) -> PluginLoader {
        if self.backends.is_empty() {
            self.backends.push(Arc::new(DylibBackend::new()));
        }
        PluginLoader {
            inner: Arc::new(LoaderInner {
                backends: self.backends,
                loaded: RwLock::new(HashMap::new()),
                cache: self.cache.unwrap_or_default(),
                errors: Mutex::new(VecDeque::new()),
                max_parallelism: self.max_parallelism,
                item_timeout: self.item_timeout,
                batches: AtomicU64::new(0),
                tasks: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
            }),
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
