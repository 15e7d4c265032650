//! Per-plugin lifecycle configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables applied to one registered plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Budget for `initialize`; overrun cancels and moves to `Error`.
    #[serde(with = "duration_ms")]
    pub initialization_timeout: Duration,
    /// Budget for a graceful `shutdown` before the force path.
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Budget for a cooperative pause command.
    #[serde(with = "duration_ms")]
    pub pause_timeout: Duration,
    /// Budget for a cooperative resume command.
    #[serde(with = "duration_ms")]
    pub resume_timeout: Duration,
    /// How often the health ticker runs.
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    /// Start the health ticker at registration.
    pub enable_health_monitoring: bool,
    /// Emit `ResourceWarning` events from health metrics.
    pub enable_resource_monitoring: bool,
    /// Attempt a timed graceful shutdown before forcing.
    pub enable_graceful_shutdown: bool,
    /// Restart automatically when the plugin enters `Error`.
    pub auto_restart_on_failure: bool,
    /// Give up auto-restart after this many attempts.
    pub max_restart_attempts: u32,
    /// Minimum gap between auto-restart attempts.
    #[serde(with = "duration_ms")]
    pub restart_delay: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            initialization_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            pause_timeout: Duration::from_secs(5),
            resume_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(60),
            enable_health_monitoring: false,
            enable_resource_monitoring: false,
            enable_graceful_shutdown: true,
            auto_restart_on_failure: false,
            max_restart_attempts: 3,
            restart_delay: Duration::from_secs(5),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = LifecycleConfig::default();
        assert_eq!(config.initialization_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.health_check_interval, Duration::from_secs(60));
        assert!(!config.auto_restart_on_failure);
        assert_eq!(config.max_restart_attempts, 3);
        assert_eq!(config.restart_delay, Duration::from_secs(5));
        assert!(config.enable_graceful_shutdown);
    }

    #[test]
    fn serde_round_trip_in_milliseconds() {
        let config = LifecycleConfig {
            initialization_timeout: Duration::from_millis(1500),
            ..LifecycleConfig::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["initialization_timeout"], 1500);
        let back: LifecycleConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.initialization_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn partial_document_fills_defaults() {
        let back: LifecycleConfig =
            serde_json::from_str("{\"max_restart_attempts\": 5}").unwrap();
        assert_eq!(back.max_restart_attempts, 5);
        assert_eq!(back.shutdown_timeout, Duration::from_secs(10));
    }
}
