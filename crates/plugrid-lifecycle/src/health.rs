//! Plugin health reporting.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use plugrid_core::{Document, Plugin, PluginId, PluginState};

/// Result of one health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// The plugin checked.
    pub plugin_id: PluginId,
    /// Whether the plugin is considered healthy.
    pub is_healthy: bool,
    /// When the check ran.
    pub last_check: DateTime<Utc>,
    /// How long the check took.
    #[serde(with = "duration_ms")]
    pub response_time: Duration,
    /// Non-blocking findings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Blocking findings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Free-form metrics (cpu, memory, and whatever the plugin reports).
    #[serde(default, skip_serializing_if = "Document::is_null")]
    pub metrics: Document,
}

impl HealthStatus {
    /// The default check: healthy iff the plugin reports `Running`.
    #[must_use]
    pub fn from_state(plugin_id: PluginId, state: PluginState) -> Self {
        let is_healthy = state == PluginState::Running;
        let errors = if is_healthy {
            Vec::new()
        } else {
            vec![format!("plugin is {state}, not running")]
        };
        Self {
            plugin_id,
            is_healthy,
            last_check: Utc::now(),
            response_time: Duration::ZERO,
            warnings: Vec::new(),
            errors,
            metrics: Document::Null,
        }
    }
}

/// Custom per-plugin health probe.
pub type HealthCallback = Arc<dyn Fn(&dyn Plugin) -> HealthStatus + Send + Sync>;

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
