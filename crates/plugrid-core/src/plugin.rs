//! Plugin identity, lifecycle states, and the plugin contract.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::descriptor::PluginDescriptor;
use crate::error::{PluginError, PluginResult};
use crate::version::Version;

/// A JSON-shaped document used for configuration, command parameters, and
/// command results.
pub type Document = serde_json::Value;

/// Unique, stable plugin identifier.
///
/// IDs are strings like `"image-codec"` or `"org.example.filter"`. They
/// must be non-empty and contain only lowercase alphanumeric characters,
/// hyphens, and dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PluginId(String);

/// Deserialize with validation — rejects malformed IDs (e.g. path
/// traversal payloads in crafted metadata or cache files).
impl<'de> Deserialize<'de> for PluginId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl PluginId {
    /// Create a new `PluginId`, validating the format.
    pub fn new(id: impl Into<String>) -> PluginResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Create a `PluginId` without validation (for tests and internal use).
    #[must_use]
    pub fn from_static(id: &str) -> Self {
        Self(id.to_string())
    }

    /// The inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive an ID from a display name: lowercased, spaces and
    /// underscores folded to hyphens, other invalid characters dropped.
    pub fn from_name(name: &str) -> PluginResult<Self> {
        let id: String = name
            .trim()
            .chars()
            .filter_map(|c| match c {
                ' ' | '_' => Some('-'),
                c if c.is_ascii_uppercase() => Some(c.to_ascii_lowercase()),
                c if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.' => {
                    Some(c)
                },
                _ => None,
            })
            .collect();
        Self::new(id)
    }

    fn validate(id: &str) -> PluginResult<()> {
        if id.is_empty() {
            return Err(PluginError::invalid_argument("plugin id must not be empty"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        {
            return Err(PluginError::invalid_argument(format!(
                "plugin id must contain only lowercase alphanumerics, hyphens, and dots, got: {id}"
            )));
        }
        if id.starts_with(['-', '.']) || id.ends_with(['-', '.']) {
            return Err(PluginError::invalid_argument(format!(
                "plugin id must not start or end with a separator, got: {id}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a plugin.
///
/// The allowed transition graph:
///
/// ```text
/// Unloaded → Loading → Loaded → Initializing → Running ⇄ Paused
///     ↑                  ↑                        │        │
///     │                  │                   Stopping ←────┘
///     │              Reloading                    │
///     │                ↑   │                   Stopped
///     └── Stopped      │   └→ Error ───────────── (any non-terminal)
///                      └────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// Not loaded in the host.
    Unloaded,
    /// The native image is being opened.
    Loading,
    /// The image is loaded; `initialize` has not run.
    Loaded,
    /// Business `initialize` is running.
    Initializing,
    /// Initialized and serving.
    Running,
    /// Cooperatively paused.
    Paused,
    /// Orderly teardown in progress.
    Stopping,
    /// Torn down; image may still be resident.
    Stopped,
    /// A failure transition landed here.
    Error,
    /// Recovery attempt after `Error`.
    Reloading,
}

impl PluginState {
    /// Whether a transition from `self` to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use PluginState::{
            Error, Initializing, Loaded, Loading, Paused, Reloading, Running, Stopped, Stopping,
            Unloaded,
        };
        // Any non-terminal state may fail into Error. Stopped and Error
        // are the terminal states with single dedicated exits.
        if next == Error {
            return !matches!(self, Error | Stopped);
        }
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Loaded)
                | (Loaded, Initializing)
                | (Initializing, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running | Paused, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Unloaded)
                | (Error, Reloading)
                | (Reloading, Loaded)
        )
    }

    /// Whether the state can serve commands.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Reloading => "reloading",
        };
        f.write_str(name)
    }
}

/// The contract every loadable unit implements.
///
/// Instances are shared (`Arc<dyn Plugin>`) between the loader and
/// callers, so all methods take `&self`; implementations manage their own
/// interior mutability. Returning [`ErrorKind::OperationNotSupported`]
/// from an optional command is acceptable.
///
/// [`ErrorKind::OperationNotSupported`]: crate::error::ErrorKind::OperationNotSupported
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Normalized metadata for this plugin.
    fn descriptor(&self) -> &PluginDescriptor;

    /// The unique plugin identifier.
    fn id(&self) -> &PluginId {
        &self.descriptor().id
    }

    /// Human-readable display name.
    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Plugin version.
    fn version(&self) -> &Version {
        &self.descriptor().version
    }

    /// Current lifecycle state, as observed by the plugin itself.
    fn state(&self) -> PluginState;

    /// Business initialization. Called after the image is loaded.
    async fn initialize(&self) -> PluginResult<()>;

    /// Orderly teardown. Must be idempotent; a second call after a
    /// graceful-shutdown timeout is the force path.
    async fn shutdown(&self) -> PluginResult<()>;

    /// Whether `initialize` has completed successfully.
    fn is_initialized(&self) -> bool;

    /// Apply a configuration document.
    fn configure(&self, _config: Document) -> PluginResult<()> {
        Err(PluginError::unsupported("configure"))
    }

    /// The currently applied configuration.
    fn current_configuration(&self) -> Document {
        Document::Null
    }

    /// The default configuration.
    fn default_configuration(&self) -> Document {
        Document::Null
    }

    /// Execute a named command with parameters.
    async fn execute_command(&self, name: &str, params: Document) -> PluginResult<Document>;

    /// The commands this plugin understands.
    fn available_commands(&self) -> Vec<String>;
}

impl fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("id", self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Shared handle to a plugin instance.
pub type PluginHandle = Arc<dyn Plugin>;

/// Convenience map type for command parameter tables.
pub type DocumentMap = HashMap<String, Document>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_plugin_ids() {
        assert!(PluginId::new("image-codec").is_ok());
        assert!(PluginId::new("org.example.filter").is_ok());
        assert!(PluginId::new("p1").is_ok());
    }

    #[test]
    fn invalid_plugin_ids() {
        assert!(PluginId::new("").is_err());
        assert!(PluginId::new("Has Upper").is_err());
        assert!(PluginId::new("with space").is_err());
        assert!(PluginId::new("under_score").is_err());
        assert!(PluginId::new("-leading").is_err());
        assert!(PluginId::new("trailing.").is_err());
        assert!(PluginId::new("../escape").is_err());
    }

    #[test]
    fn id_from_name_normalizes() {
        let id = PluginId::from_name("My Cool Plugin").unwrap();
        assert_eq!(id.as_str(), "my-cool-plugin");
        let id = PluginId::from_name("Data_Processor 2").unwrap();
        assert_eq!(id.as_str(), "data-processor-2");
    }

    #[test]
    fn deserialization_validates() {
        assert!(serde_json::from_str::<PluginId>("\"good-id\"").is_ok());
        assert!(serde_json::from_str::<PluginId>("\"../../etc\"").is_err());
    }

    #[test]
    fn normal_progression_is_allowed() {
        use PluginState::{
            Initializing, Loaded, Loading, Paused, Running, Stopped, Stopping, Unloaded,
        };
        let path = [
            Unloaded,
            Loading,
            Loaded,
            Initializing,
            Running,
            Paused,
            Running,
            Stopping,
            Stopped,
            Unloaded,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn error_and_recovery_transitions() {
        use PluginState::{Error, Loaded, Reloading, Running, Stopped};
        assert!(Running.can_transition_to(Error));
        assert!(Error.can_transition_to(Reloading));
        assert!(Reloading.can_transition_to(Loaded));
        assert!(Reloading.can_transition_to(Error));
        // Terminal states do not fail into Error.
        assert!(!Error.can_transition_to(Error));
        assert!(!Stopped.can_transition_to(Error));
    }

    #[test]
    fn disallowed_transitions_rejected() {
        use PluginState::{Loaded, Paused, Running, Stopped, Unloaded};
        assert!(!Unloaded.can_transition_to(Running));
        assert!(!Loaded.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Unloaded));
    }

    #[test]
    fn exhaustive_transition_table() {
        use PluginState::{
            Error, Initializing, Loaded, Loading, Paused, Reloading, Running, Stopped, Stopping,
            Unloaded,
        };
        let all = [
            Unloaded,
            Loading,
            Loaded,
            Initializing,
            Running,
            Paused,
            Stopping,
            Stopped,
            Error,
            Reloading,
        ];
        let allowed = [
            (Unloaded, Loading),
            (Loading, Loaded),
            (Loaded, Initializing),
            (Initializing, Running),
            (Running, Paused),
            (Paused, Running),
            (Running, Stopping),
            (Paused, Stopping),
            (Stopping, Stopped),
            (Stopped, Unloaded),
            (Error, Reloading),
            (Reloading, Loaded),
        ];
        for from in all {
            for to in all {
                let expect = allowed.contains(&(from, to))
                    || (to == Error && !matches!(from, Error | Stopped));
                assert_eq!(
                    from.can_transition_to(to),
                    expect,
                    "transition {from} -> {to}"
                );
            }
        }
    }
}
