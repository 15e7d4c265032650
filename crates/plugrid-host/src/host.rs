//! The host façade.
//!
//! [`PluginHost`] wires the loader, security validator, lifecycle
//! manager, message bus, service router, and composition engine into
//! one surface. Every load is validated at the configured security
//! level before instantiation; a failed validation never registers the
//! plugin.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use plugrid_bus::{MessageBus, ServiceRouter};
use plugrid_compose::{Composition, CompositePlugin};
use plugrid_core::{
    Document, PluginError, PluginHandle, PluginId, PluginResult, PluginState,
};
use plugrid_lifecycle::{
    CallbackId, EventCallback, LifecycleEventKind, LifecycleManager,
};
use plugrid_loader::{ImageBackend, MetadataCache, PluginLoader};
use plugrid_security::{SecurityValidator, ValidationReport, ValidatorConfig};

use crate::config::HostConfig;

/// The plugin host. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct PluginHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    config: HostConfig,
    loader: PluginLoader,
    validator: Arc<SecurityValidator>,
    lifecycle: LifecycleManager,
    bus: MessageBus,
    router: ServiceRouter,
    compositions: RwLock<HashMap<PluginId, Arc<CompositePlugin>>>,
}

impl PluginHost {
    /// Bring up a host with the native dylib image backend.
    pub fn new(config: HostConfig) -> PluginResult<Self> {
        Self::build(config, None)
    }

    /// Bring up a host with an explicit image backend.
    pub fn with_backend(
        config: HostConfig,
        backend: Arc<dyn ImageBackend>,
    ) -> PluginResult<Self> {
        Self::build(config, Some(backend))
    }

    fn build(config: HostConfig, backend: Option<Arc<dyn ImageBackend>>) -> PluginResult<Self> {
        config.validate()?;

        let cache = Arc::new(MetadataCache::new(config.cache.capacity, config.cache.ttl()));
        let mut loader = PluginLoader::builder().cache(cache);
        if let Some(backend) = backend {
            loader = loader.backend(backend);
        }
        if let Some(parallelism) = config.max_parallelism {
            loader = loader.max_parallelism(parallelism);
        }
        let loader = loader.build();

        let validator = Arc::new(SecurityValidator::new(ValidatorConfig {
            level: config.security_level,
            verify_checksums: config.verify_checksums,
            enable_threat_scan: config.enable_threat_scan,
            check_install_directory: false,
        }));

        let bus = MessageBus::with_config(config.bus.clone());
        info!(level = %config.security_level, "Plugin host ready");
        Ok(Self {
            inner: Arc::new(HostInner {
                config,
                loader,
                validator,
                lifecycle: LifecycleManager::new(),
                bus,
                router: ServiceRouter::new(),
                compositions: RwLock::new(HashMap::new()),
            }),
        })
    }

    // -----------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------

    /// Validate, load, and register a plugin image.
    ///
    /// The validator runs at the configured level before instantiation;
    /// a failed validation returns `SecurityViolation` and nothing is
    /// registered.
    pub fn load_plugin(&self, path: &Path) -> PluginResult<PluginHandle> {
        let metadata = self
            .inner
            .loader
            .read_metadata(path)
            .ok()
            .map(|descriptor| descriptor.to_document());
        let report = self.inner.validator.validate(path, metadata.as_ref());
        if !report.is_valid {
            warn!(path = %path.display(), errors = report.errors.len(), "Validation rejected plugin");
            return Err(PluginError::security(format!(
                "validation failed for {}: {}",
                path.display(),
                report.errors.join("; ")
            )));
        }

        let handle = self.inner.loader.load(path)?;
        let id = handle.id().clone();
        if let Err(e) = self
            .inner
            .lifecycle
            .register_plugin(Arc::clone(&handle), self.inner.config.lifecycle.clone())
        {
            let _ = self.inner.loader.unload(&id);
            return Err(e);
        }
        info!(plugin_id = %id, path = %path.display(), "Plugin loaded and registered");
        Ok(handle)
    }

    /// Shut down (if active), unregister, release subscriptions, and
    /// unload a plugin.
    pub async fn unload_plugin(&self, id: &PluginId) -> PluginResult<()> {
        if self.inner.lifecycle.is_registered(id) {
            if self.inner.lifecycle.plugin_state(id)?.is_active() {
                self.inner.lifecycle.shutdown_plugin(id, false).await?;
            }
            self.inner.lifecycle.unregister_plugin(id, false)?;
        }
        self.inner.bus.unsubscribe_all(id.as_str());
        self.inner.loader.unload(id)
    }

    /// Validate a plugin image without loading it.
    #[must_use]
    pub fn validate_plugin(&self, path: &Path) -> ValidationReport {
        let metadata = self
            .inner
            .loader
            .read_metadata(path)
            .ok()
            .map(|descriptor| descriptor.to_document());
        self.inner.validator.validate(path, metadata.as_ref())
    }

    /// Candidate plugin files under the configured directories.
    #[must_use]
    pub fn discover_plugins(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for dir in &self.inner.config.plugin_directories {
            paths.extend(
                self.inner
                    .loader
                    .discover(dir, self.inner.config.recursive_discovery),
            );
        }
        paths
    }

    // -----------------------------------------------------------------
    // Registry access
    // -----------------------------------------------------------------

    /// IDs of every loaded plugin, sorted.
    #[must_use]
    pub fn list_plugins(&self) -> Vec<PluginId> {
        let mut ids = self.inner.loader.loaded_plugin_ids();
        ids.sort();
        ids
    }

    /// Shared handle to a loaded plugin.
    #[must_use]
    pub fn get_plugin(&self, id: &PluginId) -> Option<PluginHandle> {
        self.inner.loader.plugin(id)
    }

    /// Whether a plugin is loaded.
    #[must_use]
    pub fn is_loaded(&self, id: &PluginId) -> bool {
        self.inner.loader.is_loaded(id)
    }

    /// Apply a configuration document to a loaded plugin.
    pub fn configure(&self, id: &PluginId, configuration: Document) -> PluginResult<()> {
        let plugin = self
            .get_plugin(id)
            .ok_or_else(|| PluginError::not_found(id))?;
        plugin.configure(configuration)
    }

    // -----------------------------------------------------------------
    // Lifecycle passthroughs
    // -----------------------------------------------------------------

    /// Drive a registered plugin to `Running`.
    pub async fn initialize_plugin(&self, id: &PluginId) -> PluginResult<()> {
        self.inner.lifecycle.initialize_plugin(id).await
    }

    /// Drive a registered plugin to `Stopped`.
    pub async fn shutdown_plugin(&self, id: &PluginId, force: bool) -> PluginResult<()> {
        self.inner.lifecycle.shutdown_plugin(id, force).await
    }

    /// The lifecycle state of a registered plugin.
    pub fn plugin_state(&self, id: &PluginId) -> PluginResult<PluginState> {
        self.inner.lifecycle.plugin_state(id)
    }

    /// Register a lifecycle event callback.
    pub fn register_event_callback(
        &self,
        plugin_filter: Option<PluginId>,
        kind_filter: Option<LifecycleEventKind>,
        callback: EventCallback,
    ) -> CallbackId {
        self.inner
            .lifecycle
            .register_event_callback(plugin_filter, kind_filter, callback)
    }

    /// Remove a lifecycle event callback.
    pub fn unregister_event_callback(&self, id: CallbackId) -> bool {
        self.inner.lifecycle.unregister_event_callback(id)
    }

    // -----------------------------------------------------------------
    // Compositions
    // -----------------------------------------------------------------

    /// Materialize a composition over loaded plugins.
    ///
    /// Member ids resolve against the loader; the composite itself is
    /// tracked by the host under the composition's id.
    pub fn create_composition(&self, composition: Composition) -> PluginResult<PluginHandle> {
        let id = composition.id.clone();
        {
            let compositions = read(&self.inner.compositions);
            if compositions.contains_key(&id) {
                return Err(PluginError::already_exists(&id));
            }
        }

        let loader = self.inner.loader.clone();
        let composite = Arc::new(CompositePlugin::assemble(composition, |member| {
            loader.plugin(member)
        })?);
        write(&self.inner.compositions).insert(id.clone(), Arc::clone(&composite));
        info!(composite = %id, "Composition created");
        Ok(composite)
    }

    /// A previously created composite.
    #[must_use]
    pub fn composition(&self, id: &PluginId) -> Option<PluginHandle> {
        read(&self.inner.compositions)
            .get(id)
            .map(|composite| Arc::clone(composite) as PluginHandle)
    }

    /// Drop a composite. Member plugins are untouched.
    pub fn remove_composition(&self, id: &PluginId) -> bool {
        write(&self.inner.compositions).remove(id).is_some()
    }

    // -----------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------

    /// Gracefully stop every plugin, then unload everything.
    ///
    /// Plugins missing the graceful budget are force-stopped; the
    /// aggregate error (if any) names them. The loader is emptied either
    /// way.
    pub async fn shutdown(&self, total_timeout: Duration) -> PluginResult<()> {
        let fleet = self
            .inner
            .lifecycle
            .shutdown_all_plugins_gracefully(total_timeout)
            .await;
        for id in self.inner.lifecycle.registered_plugins() {
            let _ = self.inner.lifecycle.unregister_plugin(&id, true);
            self.inner.bus.unsubscribe_all(id.as_str());
        }
        write(&self.inner.compositions).clear();
        self.inner.loader.unload_all().await;
        info!("Plugin host shut down");
        fleet
    }

    // -----------------------------------------------------------------
    // Component access
    // -----------------------------------------------------------------

    /// The host configuration.
    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    /// The message bus.
    #[must_use]
    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    /// The request/response router.
    #[must_use]
    pub fn router(&self) -> &ServiceRouter {
        &self.inner.router
    }

    /// The security validator.
    #[must_use]
    pub fn validator(&self) -> &Arc<SecurityValidator> {
        &self.inner.validator
    }

    /// The plugin loader.
    #[must_use]
    pub fn loader(&self) -> &PluginLoader {
        &self.inner.loader
    }

    /// The lifecycle manager.
    #[must_use]
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.inner.lifecycle
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("loaded", &self.inner.loader.loaded_plugin_count())
            .field("level", &self.inner.config.security_level)
            .finish_non_exhaustive()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
