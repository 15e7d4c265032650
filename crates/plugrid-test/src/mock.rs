//! A scriptable plugin for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use plugrid_core::{
    Capabilities, Document, Plugin, PluginDescriptor, PluginError, PluginResult, PluginState,
    Version,
};

/// A plugin whose behavior is configured up front.
///
/// Every failure mode the host must tolerate can be scripted: slow or
/// failing initialization, slow or failing shutdown, a command that
/// always fails, and optional support for state migration commands.
pub struct MockPlugin {
    descriptor: PluginDescriptor,
    state: RwLock<PluginState>,
    initialized: AtomicBool,
    config: RwLock<Document>,
    default_config: Document,
    init_delay: Duration,
    fail_init: bool,
    shutdown_delay: Duration,
    fail_shutdown: bool,
    supports_migration: bool,
    failing_command: Option<String>,
    canned_responses: HashMap<String, Document>,
    init_calls: AtomicU32,
    shutdown_calls: AtomicU32,
    command_log: Mutex<Vec<String>>,
}

impl MockPlugin {
    /// Start configuring a mock with the given ID.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a valid plugin ID.
    #[must_use]
    pub fn builder(id: &str) -> MockPluginBuilder {
        MockPluginBuilder::new(id)
    }

    /// A mock backed by an existing descriptor, in the `Loaded` state.
    #[must_use]
    pub fn from_descriptor(descriptor: PluginDescriptor) -> Self {
        MockPluginBuilder {
            descriptor,
            ..MockPluginBuilder::new("placeholder")
        }
        .build()
    }

    /// Force the observed lifecycle state.
    pub fn set_state(&self, state: PluginState) {
        *write(&self.state) = state;
    }

    /// How many times `initialize` has been called.
    #[must_use]
    pub fn init_calls(&self) -> u32 {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// How many times `shutdown` has been called.
    #[must_use]
    pub fn shutdown_calls(&self) -> u32 {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Names of every command executed, in order.
    #[must_use]
    pub fn executed_commands(&self) -> Vec<String> {
        self.command_log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn state(&self) -> PluginState {
        *read(&self.state)
    }

    async fn initialize(&self) -> PluginResult<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        if self.fail_init {
            self.set_state(PluginState::Error);
            return Err(PluginError::execution_failed("mock initialization failure"));
        }
        self.initialized.store(true, Ordering::SeqCst);
        self.set_state(PluginState::Running);
        Ok(())
    }

    async fn shutdown(&self) -> PluginResult<()> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        if !self.shutdown_delay.is_zero() {
            tokio::time::sleep(self.shutdown_delay).await;
        }
        if self.fail_shutdown {
            return Err(PluginError::execution_failed("mock shutdown failure"));
        }
        self.initialized.store(false, Ordering::SeqCst);
        self.set_state(PluginState::Stopped);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn configure(&self, config: Document) -> PluginResult<()> {
        *write(&self.config) = config;
        Ok(())
    }

    fn current_configuration(&self) -> Document {
        read(&self.config).clone()
    }

    fn default_configuration(&self) -> Document {
        self.default_config.clone()
    }

    async fn execute_command(&self, name: &str, params: Document) -> PluginResult<Document> {
        self.command_log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(name.to_string());

        if self.failing_command.as_deref() == Some(name) {
            return Err(PluginError::execution_failed(format!(
                "mock command {name} failed"
            )));
        }
        if let Some(response) = self.canned_responses.get(name) {
            return Ok(response.clone());
        }
        match name {
            "echo" => Ok(params),
            "migrate_state" if self.supports_migration => Ok(json!({
                "migrated": true,
                "from": params.get("from_version"),
                "to": params.get("to_version"),
            })),
            "backup_state" if self.supports_migration => Ok(json!({
                "config": self.current_configuration(),
            })),
            "restore_state" if self.supports_migration => Ok(json!({ "restored": true })),
            "cleanup_resources" => Ok(json!({ "cleaned": true })),
            _ => Err(PluginError::unsupported(name)),
        }
    }

    fn available_commands(&self) -> Vec<String> {
        let mut commands = vec!["echo".to_string(), "cleanup_resources".to_string()];
        if self.supports_migration {
            commands.extend(
                ["migrate_state", "backup_state", "restore_state"]
                    .iter()
                    .map(ToString::to_string),
            );
        }
        commands.extend(self.canned_responses.keys().cloned());
        commands.sort();
        commands
    }
}

/// Builder for [`MockPlugin`].
pub struct MockPluginBuilder {
    descriptor: PluginDescriptor,
    initial_state: PluginState,
    default_config: Document,
    init_delay: Duration,
    fail_init: bool,
    shutdown_delay: Duration,
    fail_shutdown: bool,
    supports_migration: bool,
    failing_command: Option<String>,
    canned_responses: HashMap<String, Document>,
}

impl MockPluginBuilder {
    fn new(id: &str) -> Self {
        Self {
            descriptor: PluginDescriptor::minimal(id, id, Version::new(1, 0, 0))
                .expect("valid mock plugin id"),
            initial_state: PluginState::Loaded,
            default_config: Document::Null,
            init_delay: Duration::ZERO,
            fail_init: false,
            shutdown_delay: Duration::ZERO,
            fail_shutdown: false,
            supports_migration: false,
            failing_command: None,
            canned_responses: HashMap::new(),
        }
    }

    /// Set the plugin version.
    #[must_use]
    pub fn version(mut self, version: Version) -> Self {
        self.descriptor.version = version;
        self
    }

    /// Add a capability flag.
    #[must_use]
    pub fn capability(mut self, capability: Capabilities) -> Self {
        self.descriptor.capabilities = self.descriptor.capabilities.with(capability);
        self
    }

    /// Set the initial lifecycle state.
    #[must_use]
    pub fn initial_state(mut self, state: PluginState) -> Self {
        self.initial_state = state;
        self
    }

    /// Default configuration document.
    #[must_use]
    pub fn default_config(mut self, config: Document) -> Self {
        self.default_config = config;
        self
    }

    /// Delay `initialize` by this much.
    #[must_use]
    pub fn init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    /// Make `initialize` fail.
    #[must_use]
    pub fn fail_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Delay `shutdown` by this much.
    #[must_use]
    pub fn shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay = delay;
        self
    }

    /// Make `shutdown` fail.
    #[must_use]
    pub fn fail_shutdown(mut self) -> Self {
        self.fail_shutdown = true;
        self
    }

    /// Support the state migration command set.
    #[must_use]
    pub fn supports_migration(mut self) -> Self {
        self.supports_migration = true;
        self
    }

    /// Make one named command always fail.
    #[must_use]
    pub fn failing_command(mut self, name: &str) -> Self {
        self.failing_command = Some(name.to_string());
        self
    }

    /// Register a command with a fixed response.
    #[must_use]
    pub fn command(mut self, name: &str, response: Document) -> Self {
        self.canned_responses.insert(name.to_string(), response);
        self
    }

    /// Build the mock.
    #[must_use]
    pub fn build(self) -> MockPlugin {
        MockPlugin {
            descriptor: self.descriptor,
            state: RwLock::new(self.initial_state),
            initialized: AtomicBool::new(false),
            config: RwLock::new(Document::Null),
            default_config: self.default_config,
            init_delay: self.init_delay,
            fail_init: self.fail_init,
            shutdown_delay: self.shutdown_delay,
            fail_shutdown: self.fail_shutdown,
            supports_migration: self.supports_migration,
            failing_command: self.failing_command,
            canned_responses: self.canned_responses,
            init_calls: AtomicU32::new(0),
            shutdown_calls: AtomicU32::new(0),
            command_log: Mutex::new(Vec::new()),
        }
    }

    /// Build the mock behind a shared handle.
    #[must_use]
    pub fn build_handle(self) -> std::sync::Arc<MockPlugin> {
        std::sync::Arc::new(self.build())
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
