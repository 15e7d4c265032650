//! The lifecycle manager.
//!
//! Owns a state machine per registered plugin and drives timed
//! initialization, shutdown, pause/resume, restart, health monitoring,
//! state backup, and coordinated fleet shutdown. Plugin calls are always
//! made outside the registry lock; the lock covers bookkeeping only.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use plugrid_core::{
    Document, ErrorKind, PluginError, PluginHandle, PluginId, PluginResult, PluginState,
};

use crate::config::LifecycleConfig;
use crate::event::{
    CallbackId, EventCallback, EventDispatcher, LifecycleEvent, LifecycleEventKind,
};
use crate::health::{HealthCallback, HealthStatus};

/// Per-plugin event history kept for diagnostics and backups.
const EVENT_HISTORY_CAP: usize = 100;
/// How many recent events a state backup carries.
const BACKUP_EVENT_COUNT: usize = 10;
/// Backup document format version.
const BACKUP_FORMAT_VERSION: u32 = 1;

struct PluginEntry {
    plugin: PluginHandle,
    config: LifecycleConfig,
    state: PluginState,
    events: VecDeque<LifecycleEvent>,
    health: Option<HealthStatus>,
    health_callback: Option<HealthCallback>,
    health_task: Option<JoinHandle<()>>,
    restart_attempts: u32,
    last_restart: Option<Instant>,
}

impl Drop for PluginEntry {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
    }
}

/// Aggregate counters for [`LifecycleManager::statistics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleStatistics {
    /// Registered plugins.
    pub registered: usize,
    /// Count of plugins per state name.
    pub by_state: BTreeMap<String, usize>,
    /// Plugins with an active health ticker.
    pub monitored: usize,
    /// Plugins whose last health check passed.
    pub healthy: usize,
    /// Plugins whose last health check failed.
    pub unhealthy: usize,
    /// Registered event callbacks.
    pub event_callbacks: usize,
    /// Auto-restart attempts made.
    pub restart_attempts: u64,
    /// Auto-restart attempts that recovered the plugin.
    pub restarts_succeeded: u64,
}

struct ManagerInner {
    plugins: Mutex<HashMap<PluginId, PluginEntry>>,
    dispatcher: EventDispatcher,
    restart_attempts: AtomicU64,
    restarts_succeeded: AtomicU64,
}

/// The lifecycle manager. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<ManagerInner>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                plugins: Mutex::new(HashMap::new()),
                dispatcher: EventDispatcher::new(),
                restart_attempts: AtomicU64::new(0),
                restarts_succeeded: AtomicU64::new(0),
            }),
        }
    }

    // -----------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------

    /// Register a plugin in the `Unloaded` state.
    ///
    /// A plugin may be registered at most once; a second registration of
    /// the same id fails with `AlreadyExists`.
    pub fn register_plugin(
        &self,
        plugin: PluginHandle,
        config: LifecycleConfig,
    ) -> PluginResult<()> {
        let id = plugin.id().clone();
        let monitor = config.enable_health_monitoring;
        {
            let mut plugins = lock(&self.inner.plugins);
            if plugins.contains_key(&id) {
                return Err(PluginError::already_exists(&id));
            }
            plugins.insert(
                id.clone(),
                PluginEntry {
                    plugin,
                    config,
                    state: PluginState::Unloaded,
                    events: VecDeque::new(),
                    health: None,
                    health_callback: None,
                    health_task: None,
                    restart_attempts: 0,
                    last_restart: None,
                },
            );
        }
        if monitor {
            // Registration config asked for monitoring from the start.
            let _ = self.enable_health_monitoring(&id, None);
        }
        info!(plugin_id = %id, "Registered plugin");
        Ok(())
    }

    /// Remove a plugin from the manager.
    ///
    /// Rejected with `InvalidState` while the plugin is `Running` or
    /// `Paused` unless `force` is set.
    pub fn unregister_plugin(&self, id: &PluginId, force: bool) -> PluginResult<()> {
        let mut plugins = lock(&self.inner.plugins);
        let entry = plugins
            .get(id)
            .ok_or_else(|| PluginError::not_found(id))?;
        if entry.state.is_active() && !force {
            return Err(PluginError::invalid_state(format!(
                "{id} is {}, shut it down before unregistering",
                entry.state
            )));
        }
        plugins.remove(id);
        info!(plugin_id = %id, "Unregistered plugin");
        Ok(())
    }

    /// Whether a plugin is registered.
    #[must_use]
    pub fn is_registered(&self, id: &PluginId) -> bool {
        lock(&self.inner.plugins).contains_key(id)
    }

    /// IDs of every registered plugin.
    #[must_use]
    pub fn registered_plugins(&self) -> Vec<PluginId> {
        lock(&self.inner.plugins).keys().cloned().collect()
    }

    /// Shared handle to a registered plugin.
    pub fn plugin(&self, id: &PluginId) -> PluginResult<PluginHandle> {
        self.with_entry(id, |entry| Arc::clone(&entry.plugin))
    }

    /// The manager-observed state of a plugin.
    pub fn plugin_state(&self, id: &PluginId) -> PluginResult<PluginState> {
        self.with_entry(id, |entry| entry.state)
    }

    /// The plugin's lifecycle configuration.
    pub fn plugin_config(&self, id: &PluginId) -> PluginResult<LifecycleConfig> {
        self.with_entry(id, |entry| entry.config.clone())
    }

    /// Recent lifecycle events for a plugin, oldest first.
    pub fn event_history(&self, id: &PluginId) -> PluginResult<Vec<LifecycleEvent>> {
        self.with_entry(id, |entry| entry.events.iter().cloned().collect())
    }

    // -----------------------------------------------------------------
    // Timed lifecycle operations
    // -----------------------------------------------------------------

    /// Drive `Unloaded -> Loading -> Loaded -> Initializing -> Running`.
    ///
    /// The plugin's `initialize` runs under `initialization_timeout`;
    /// overrun moves the plugin to `Error` and surfaces
    /// `OperationCancelled`.
    pub async fn initialize_plugin(&self, id: &PluginId) -> PluginResult<()> {
        self.transition(id, PluginState::Loading)?;
        self.transition(id, PluginState::Loaded)?;
        self.initialize_from_loaded(id).await
    }

    async fn initialize_from_loaded(&self, id: &PluginId) -> PluginResult<()> {
        let (plugin, budget) = self.with_entry(id, |entry| {
            (Arc::clone(&entry.plugin), entry.config.initialization_timeout)
        })?;
        self.transition(id, PluginState::Initializing)?;
        self.record_event(LifecycleEvent::new(
            id.clone(),
            LifecycleEventKind::BeforeInitialize,
        ));

        let started = Instant::now();
        match tokio::time::timeout(budget, plugin.initialize()).await {
            Ok(Ok(())) => {
                self.transition(id, PluginState::Running)?;
                self.record_event(
                    LifecycleEvent::new(id.clone(), LifecycleEventKind::AfterInitialize)
                        .with_details(json!({
                            "elapsed_ms": u64::try_from(started.elapsed().as_millis())
                                .unwrap_or(u64::MAX),
                        })),
                );
                info!(plugin_id = %id, "Plugin initialized");
                Ok(())
            },
            Ok(Err(e)) => {
                self.enter_error(id, e.kind());
                self.record_event(
                    LifecycleEvent::new(id.clone(), LifecycleEventKind::AfterInitialize)
                        .with_error(e.kind()),
                );
                Err(e)
            },
            Err(_) => {
                self.enter_error(id, ErrorKind::OperationCancelled);
                self.record_event(
                    LifecycleEvent::new(id.clone(), LifecycleEventKind::Timeout)
                        .with_details(json!({ "operation": "initialize" })),
                );
                self.record_event(
                    LifecycleEvent::new(id.clone(), LifecycleEventKind::AfterInitialize)
                        .with_error(ErrorKind::OperationCancelled),
                );
                Err(PluginError::cancelled(format!(
                    "initialize of {id} exceeded {budget:?}"
                )))
            },
        }
    }

    /// Drive `Running/Paused -> Stopping -> Stopped`.
    ///
    /// Without `force`, the plugin gets `shutdown_timeout` to shut down
    /// gracefully; on overrun the shutdown is invoked a second time (the
    /// force path, which `shutdown` must treat as idempotent).
    pub async fn shutdown_plugin(&self, id: &PluginId, force: bool) -> PluginResult<()> {
        self.shutdown_with_report(id, force).await.map(|_| ())
    }

    /// Like [`shutdown_plugin`](Self::shutdown_plugin); the `bool` says
    /// whether the shutdown completed within the graceful budget.
    async fn shutdown_with_report(&self, id: &PluginId, force: bool) -> PluginResult<bool> {
        let (plugin, config) = self.with_entry(id, |entry| {
            (Arc::clone(&entry.plugin), entry.config.clone())
        })?;
        self.transition(id, PluginState::Stopping)?;
        self.record_event(LifecycleEvent::new(
            id.clone(),
            LifecycleEventKind::BeforeShutdown,
        ));

        let graceful = if !force && config.enable_graceful_shutdown {
            match tokio::time::timeout(config.shutdown_timeout, plugin.shutdown()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(plugin_id = %id, error = %e, "Graceful shutdown failed");
                    self.record_event(
                        LifecycleEvent::new(id.clone(), LifecycleEventKind::Error)
                            .with_error(e.kind()),
                    );
                    false
                },
                Err(_) => {
                    self.record_event(
                        LifecycleEvent::new(id.clone(), LifecycleEventKind::Timeout)
                            .with_details(json!({ "operation": "shutdown" })),
                    );
                    // Force path: a second call, awaited to completion.
                    if let Err(e) = plugin.shutdown().await {
                        warn!(plugin_id = %id, error = %e, "Forced shutdown failed");
                    }
                    false
                },
            }
        } else {
            if let Err(e) = plugin.shutdown().await {
                warn!(plugin_id = %id, error = %e, "Forced shutdown failed");
            }
            false
        };

        self.transition(id, PluginState::Stopped)?;
        self.record_event(
            LifecycleEvent::new(id.clone(), LifecycleEventKind::AfterShutdown)
                .with_details(json!({ "graceful": graceful })),
        );
        info!(plugin_id = %id, graceful, "Plugin shut down");
        Ok(graceful)
    }

    /// Cooperatively pause a running plugin.
    ///
    /// Rejected with `InvalidState` unless the plugin is `Running`; no
    /// event is emitted for a rejected call.
    pub async fn pause_plugin(&self, id: &PluginId) -> PluginResult<()> {
        self.ensure_can_transition(id, PluginState::Paused)?;
        self.run_optional_command(id, "pause", |c| c.pause_timeout).await?;
        self.transition(id, PluginState::Paused)?;
        Ok(())
    }

    /// Resume a paused plugin.
    pub async fn resume_plugin(&self, id: &PluginId) -> PluginResult<()> {
        self.ensure_can_transition(id, PluginState::Running)?;
        self.run_optional_command(id, "resume", |c| c.resume_timeout).await?;
        self.transition(id, PluginState::Running)?;
        Ok(())
    }

    /// Shut down (if needed) and initialize again.
    pub async fn restart_plugin(&self, id: &PluginId) -> PluginResult<()> {
        match self.plugin_state(id)? {
            state if state.is_active() => {
                self.shutdown_plugin(id, false).await?;
                self.transition(id, PluginState::Unloaded)?;
                self.initialize_plugin(id).await
            },
            PluginState::Stopped => {
                self.transition(id, PluginState::Unloaded)?;
                self.initialize_plugin(id).await
            },
            PluginState::Unloaded => self.initialize_plugin(id).await,
            PluginState::Error => {
                self.transition(id, PluginState::Reloading)?;
                let plugin = self.plugin(id)?;
                // Best-effort teardown before re-initializing.
                if let Err(e) = plugin.shutdown().await {
                    debug!(plugin_id = %id, error = %e, "Teardown before reload failed");
                }
                self.transition(id, PluginState::Loaded)?;
                self.initialize_from_loaded(id).await
            },
            other => Err(PluginError::invalid_state(format!(
                "cannot restart {id} from state {other}"
            ))),
        }
    }

    async fn run_optional_command(
        &self,
        id: &PluginId,
        command: &str,
        budget: impl Fn(&LifecycleConfig) -> Duration,
    ) -> PluginResult<()> {
        let (plugin, budget) = self.with_entry(id, |entry| {
            (Arc::clone(&entry.plugin), budget(&entry.config))
        })?;
        if !plugin.available_commands().iter().any(|c| c == command) {
            return Ok(());
        }
        match tokio::time::timeout(budget, plugin.execute_command(command, Document::Null)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if e.kind() == ErrorKind::OperationNotSupported => Ok(()),
            Ok(Err(e)) => {
                self.enter_error(id, e.kind());
                Err(e)
            },
            Err(_) => {
                self.enter_error(id, ErrorKind::Timeout);
                Err(PluginError::timeout(format!(
                    "{command} of {id} exceeded {budget:?}"
                )))
            },
        }
    }

    // -----------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------

    /// Register a lifecycle event callback.
    pub fn register_event_callback(
        &self,
        plugin_filter: Option<PluginId>,
        kind_filter: Option<LifecycleEventKind>,
        callback: EventCallback,
    ) -> CallbackId {
        self.inner.dispatcher.register(plugin_filter, kind_filter, callback)
    }

    /// Remove an event callback.
    pub fn unregister_event_callback(&self, id: CallbackId) -> bool {
        self.inner.dispatcher.unregister(id)
    }

    // -----------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------

    /// Start (or restart) the health ticker for a plugin.
    pub fn enable_health_monitoring(
        &self,
        id: &PluginId,
        callback: Option<HealthCallback>,
    ) -> PluginResult<()> {
        let interval = self.with_entry(id, |entry| {
            entry.health_callback = callback.clone();
            if let Some(task) = entry.health_task.take() {
                task.abort();
            }
            entry.config.health_check_interval
        })?;

        let manager = self.clone();
        let plugin_id = id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if manager.check_plugin_health(&plugin_id).is_err() {
                    break; // plugin was unregistered
                }
            }
        });
        self.with_entry(id, |entry| entry.health_task = Some(task))?;
        Ok(())
    }

    /// Stop the health ticker for a plugin.
    pub fn disable_health_monitoring(&self, id: &PluginId) -> PluginResult<()> {
        self.with_entry(id, |entry| {
            entry.health_callback = None;
            if let Some(task) = entry.health_task.take() {
                task.abort();
            }
        })
    }

    /// Run one health check now.
    ///
    /// Uses the plugin's custom probe when one is registered, otherwise
    /// the plugin is healthy iff it is `Running`. A `HealthCheck` event
    /// is emitted only when healthiness flips.
    pub fn check_plugin_health(&self, id: &PluginId) -> PluginResult<HealthStatus> {
        let (plugin, callback, state, was_healthy, resource_monitoring) =
            self.with_entry(id, |entry| {
                (
                    Arc::clone(&entry.plugin),
                    entry.health_callback.clone(),
                    entry.state,
                    entry.health.as_ref().is_none_or(|h| h.is_healthy),
                    entry.config.enable_resource_monitoring,
                )
            })?;

        let started = Instant::now();
        let mut status = match callback {
            Some(probe) => probe(plugin.as_ref()),
            None => HealthStatus::from_state(id.clone(), state),
        };
        status.response_time = started.elapsed();
        status.last_check = Utc::now();

        if status.is_healthy != was_healthy {
            self.record_event(
                LifecycleEvent::new(id.clone(), LifecycleEventKind::HealthCheck)
                    .with_details(json!({ "healthy": status.is_healthy })),
            );
        }
        if resource_monitoring && !status.warnings.is_empty() {
            self.record_event(
                LifecycleEvent::new(id.clone(), LifecycleEventKind::ResourceWarning)
                    .with_details(json!({ "warnings": status.warnings })),
            );
        }

        self.with_entry(id, |entry| entry.health = Some(status.clone()))?;
        Ok(status)
    }

    // -----------------------------------------------------------------
    // State migration, backup, cleanup
    // -----------------------------------------------------------------

    /// Ask the plugin to migrate its internal state.
    ///
    /// Fails with `OperationNotSupported` when the plugin does not expose
    /// the `migrate_state` command.
    pub async fn migrate_plugin_state(
        &self,
        id: &PluginId,
        payload: Document,
    ) -> PluginResult<Document> {
        let plugin = self.plugin(id)?;
        if !plugin.available_commands().iter().any(|c| c == "migrate_state") {
            return Err(PluginError::unsupported("migrate_state"));
        }
        plugin.execute_command("migrate_state", payload).await
    }

    /// Capture a restorable snapshot of the plugin's lifecycle state.
    pub async fn backup_plugin_state(&self, id: &PluginId) -> PluginResult<Document> {
        let (plugin, config, state, events, health) = self.with_entry(id, |entry| {
            let skip = entry.events.len().saturating_sub(BACKUP_EVENT_COUNT);
            (
                Arc::clone(&entry.plugin),
                entry.config.clone(),
                entry.state,
                entry.events.iter().skip(skip).cloned().collect::<Vec<_>>(),
                entry.health.clone(),
            )
        })?;

        let plugin_state = if plugin.available_commands().iter().any(|c| c == "backup_state") {
            Some(plugin.execute_command("backup_state", Document::Null).await?)
        } else {
            None
        };

        Ok(json!({
            "format_version": BACKUP_FORMAT_VERSION,
            "id": id,
            "version": plugin.version().to_string(),
            "state": state,
            "config": config,
            "recent_events": events,
            "health": health,
            "backup_state": plugin_state,
        }))
    }

    /// Restore from a snapshot captured by
    /// [`backup_plugin_state`](Self::backup_plugin_state).
    ///
    /// The snapshot must belong to the same plugin id.
    pub async fn restore_plugin_state(
        &self,
        id: &PluginId,
        backup: &Document,
    ) -> PluginResult<()> {
        let backup_id = backup.get("id").and_then(Document::as_str);
        if backup_id != Some(id.as_str()) {
            return Err(PluginError::invalid_argument(format!(
                "backup belongs to {:?}, not {id}",
                backup_id.unwrap_or("<missing>")
            )));
        }

        if let Some(config) = backup.get("config") {
            let config: LifecycleConfig = serde_json::from_value(config.clone())?;
            self.with_entry(id, |entry| entry.config = config)?;
        }

        let plugin = self.plugin(id)?;
        let inner_state = backup.get("backup_state").cloned().unwrap_or(Document::Null);
        if !inner_state.is_null()
            && plugin.available_commands().iter().any(|c| c == "restore_state")
        {
            plugin.execute_command("restore_state", inner_state).await?;
        }
        Ok(())
    }

    /// Stop timers, clear history, reset restart counters, and let the
    /// plugin release whatever it holds.
    pub async fn cleanup_plugin_resources(&self, id: &PluginId) -> PluginResult<()> {
        let plugin = self.with_entry(id, |entry| {
            if let Some(task) = entry.health_task.take() {
                task.abort();
            }
            entry.health_callback = None;
            entry.health = None;
            entry.events.clear();
            entry.restart_attempts = 0;
            entry.last_restart = None;
            Arc::clone(&entry.plugin)
        })?;

        if plugin.available_commands().iter().any(|c| c == "cleanup_resources") {
            match plugin.execute_command("cleanup_resources", Document::Null).await {
                Ok(_) => {},
                Err(e) if e.kind() == ErrorKind::OperationNotSupported => {},
                Err(e) => {
                    warn!(plugin_id = %id, error = %e, "Resource cleanup command failed");
                },
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Fleet shutdown
    // -----------------------------------------------------------------

    /// Shut down every active plugin in parallel under a global budget.
    ///
    /// Plugins that miss the budget are force-stopped. Returns an error
    /// listing every plugin that did not shut down gracefully; all
    /// registered plugins end in `Stopped` (or were never active).
    pub async fn shutdown_all_plugins_gracefully(
        &self,
        total_timeout: Duration,
    ) -> PluginResult<()> {
        let ids: Vec<PluginId> = {
            let plugins = lock(&self.inner.plugins);
            plugins
                .iter()
                .filter(|(_, entry)| entry.state.is_active())
                .map(|(id, _)| id.clone())
                .collect()
        };
        if ids.is_empty() {
            return Ok(());
        }

        let mut set = JoinSet::new();
        for id in &ids {
            let manager = self.clone();
            let id = id.clone();
            set.spawn(async move {
                let graceful = manager.shutdown_with_report(&id, false).await;
                (id, graceful)
            });
        }

        let deadline = Instant::now() + total_timeout;
        let mut failed: Vec<PluginId> = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, set.join_next()).await {
                Ok(Some(Ok((_, Ok(true))))) => {},
                Ok(Some(Ok((id, Ok(false)) | (id, Err(_))))) => failed.push(id),
                Ok(Some(Err(_))) => {},
                Ok(None) => break,
                Err(_) => {
                    // Global budget exhausted; force the remainder.
                    set.abort_all();
                    for id in &ids {
                        if self.plugin_state(id).is_ok_and(|s| s != PluginState::Stopped)
                            && !failed.contains(id)
                        {
                            self.force_stop(id);
                            failed.push(id.clone());
                        }
                    }
                    break;
                },
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            failed.sort();
            let names: Vec<String> = failed.iter().map(ToString::to_string).collect();
            Err(PluginError::timeout(format!(
                "plugins did not shut down gracefully: {}",
                names.join(", ")
            )))
        }
    }

    /// Immediately mark a plugin `Stopped`, firing its shutdown off-band.
    fn force_stop(&self, id: &PluginId) {
        let plugin = match self.plugin(id) {
            Ok(plugin) => plugin,
            Err(_) => return,
        };
        let state = self.plugin_state(id).unwrap_or(PluginState::Stopped);
        if state.is_active() {
            let _ = self.transition(id, PluginState::Stopping);
        }
        if self.plugin_state(id).is_ok_and(|s| s == PluginState::Stopping) {
            tokio::spawn(async move {
                let _ = plugin.shutdown().await;
            });
            let _ = self.transition(id, PluginState::Stopped);
        }
    }

    // -----------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------

    /// Aggregate counters across all registered plugins.
    #[must_use]
    pub fn statistics(&self) -> LifecycleStatistics {
        let plugins = lock(&self.inner.plugins);
        let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
        let mut monitored = 0;
        let mut healthy = 0;
        let mut unhealthy = 0;
        for entry in plugins.values() {
            *by_state.entry(entry.state.to_string()).or_default() += 1;
            if entry.health_task.is_some() {
                monitored += 1;
            }
            match entry.health.as_ref().map(|h| h.is_healthy) {
                Some(true) => healthy += 1,
                Some(false) => unhealthy += 1,
                None => {},
            }
        }
        LifecycleStatistics {
            registered: plugins.len(),
            by_state,
            monitored,
            healthy,
            unhealthy,
            event_callbacks: self.inner.dispatcher.len(),
            restart_attempts: self.inner.restart_attempts.load(Ordering::Relaxed),
            restarts_succeeded: self.inner.restarts_succeeded.load(Ordering::Relaxed),
        }
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn with_entry<T>(
        &self,
        id: &PluginId,
        f: impl FnOnce(&mut PluginEntry) -> T,
    ) -> PluginResult<T> {
        let mut plugins = lock(&self.inner.plugins);
        let entry = plugins
            .get_mut(id)
            .ok_or_else(|| PluginError::not_found(id))?;
        Ok(f(entry))
    }

    fn ensure_can_transition(&self, id: &PluginId, next: PluginState) -> PluginResult<()> {
        self.with_entry(id, |entry| {
            if entry.state.can_transition_to(next) {
                Ok(())
            } else {
                Err(PluginError::invalid_state(format!(
                    "{id} cannot move from {} to {next}",
                    entry.state
                )))
            }
        })?
    }

    fn transition(&self, id: &PluginId, next: PluginState) -> PluginResult<PluginState> {
        let old = {
            let mut plugins = lock(&self.inner.plugins);
            let entry = plugins
                .get_mut(id)
                .ok_or_else(|| PluginError::not_found(id))?;
            if !entry.state.can_transition_to(next) {
                return Err(PluginError::invalid_state(format!(
                    "{id} cannot move from {} to {next}",
                    entry.state
                )));
            }
            let old = entry.state;
            entry.state = next;
            old
        };
        debug!(plugin_id = %id, from = %old, to = %next, "State transition");
        self.record_event(
            LifecycleEvent::new(id.clone(), LifecycleEventKind::StateChanged)
                .with_states(old, next),
        );
        Ok(old)
    }

    /// Move to `Error` (when allowed), emit an `Error` event, and kick
    /// off auto-restart if the plugin's configuration asks for it.
    fn enter_error(&self, id: &PluginId, kind: ErrorKind) {
        let _ = self.transition(id, PluginState::Error);
        self.record_event(
            LifecycleEvent::new(id.clone(), LifecycleEventKind::Error).with_error(kind),
        );
        self.maybe_auto_restart(id);
    }

    fn maybe_auto_restart(&self, id: &PluginId) {
        let eligible = self
            .with_entry(id, |entry| {
                let config = &entry.config;
                let delay_ok = entry
                    .last_restart
                    .is_none_or(|at| at.elapsed() >= config.restart_delay);
                let go = config.auto_restart_on_failure
                    && entry.restart_attempts < config.max_restart_attempts
                    && delay_ok;
                if go {
                    entry.restart_attempts = entry.restart_attempts.saturating_add(1);
                    entry.last_restart = Some(Instant::now());
                }
                go
            })
            .unwrap_or(false);
        if !eligible {
            return;
        }

        self.inner.restart_attempts.fetch_add(1, Ordering::Relaxed);
        let manager = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            info!(plugin_id = %id, "Auto-restarting plugin");
            if manager.restart_plugin(&id).await.is_ok() {
                manager.inner.restarts_succeeded.fetch_add(1, Ordering::Relaxed);
                let _ = manager.with_entry(&id, |entry| entry.restart_attempts = 0);
            }
        });
    }

    fn record_event(&self, event: LifecycleEvent) {
        {
            let mut plugins = lock(&self.inner.plugins);
            if let Some(entry) = plugins.get_mut(&event.plugin_id) {
                if entry.events.len() >= EVENT_HISTORY_CAP {
                    entry.events.pop_front();
                }
                entry.events.push_back(event.clone());
            }
        }
        self.inner.dispatcher.emit(&event);
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("registered", &lock(&self.inner.plugins).len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
