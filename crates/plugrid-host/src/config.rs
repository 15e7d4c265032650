//! Host configuration, loadable from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use plugrid_bus::BusConfig;
use plugrid_core::{PluginError, PluginResult};
use plugrid_lifecycle::LifecycleConfig;
use plugrid_security::SecurityLevel;

/// Metadata cache tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum cached entries before eviction.
    pub capacity: usize,
    /// Entry time-to-live, in seconds.
    pub ttl_secs: u64,
}

impl CacheSettings {
    /// TTL as a duration.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl_secs: 300,
        }
    }
}

/// Everything the host needs to come up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directories scanned for plugin images.
    pub plugin_directories: Vec<PathBuf>,
    /// Whether discovery descends into subdirectories.
    pub recursive_discovery: bool,
    /// Validation level applied to every load.
    pub security_level: SecurityLevel,
    /// Verify embedded or sibling checksums during validation.
    pub verify_checksums: bool,
    /// Run the signature-based threat scan during validation.
    pub enable_threat_scan: bool,
    /// Metadata cache tunables.
    pub cache: CacheSettings,
    /// Message bus tunables.
    pub bus: BusConfig,
    /// Lifecycle defaults applied to every loaded plugin.
    pub lifecycle: LifecycleConfig,
    /// Worker pool bound for batch loads; defaults to the hardware
    /// parallelism.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallelism: Option<usize>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plugin_directories: Vec::new(),
            recursive_discovery: false,
            security_level: SecurityLevel::default(),
            // Checksum verification is the stage-3 gate of the validator;
            // it stays on unless the operator opts out.
            verify_checksums: true,
            enable_threat_scan: false,
            cache: CacheSettings::default(),
            bus: BusConfig::default(),
            lifecycle: LifecycleConfig::default(),
            max_parallelism: None,
        }
    }
}

impl HostConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> PluginResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PluginError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| {
            PluginError::configuration(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty TOML.
    pub fn save(&self, path: &Path) -> PluginResult<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| PluginError::configuration(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, text).map_err(|e| {
            PluginError::configuration(format!("cannot write {}: {e}", path.display()))
        })
    }

    /// Reject configurations the host cannot run with.
    pub fn validate(&self) -> PluginResult<()> {
        if self.cache.capacity == 0 {
            return Err(PluginError::configuration("cache.capacity must be at least 1"));
        }
        if self.bus.queue_capacity == 0 {
            return Err(PluginError::configuration(
                "bus.queue_capacity must be at least 1",
            ));
        }
        if self.lifecycle.initialization_timeout.is_zero() {
            return Err(PluginError::configuration(
                "lifecycle.initialization_timeout must be non-zero",
            ));
        }
        if self.lifecycle.shutdown_timeout.is_zero() {
            return Err(PluginError::configuration(
                "lifecycle.shutdown_timeout must be non-zero",
            ));
        }
        if self.max_parallelism == Some(0) {
            return Err(PluginError::configuration(
                "max_parallelism must be at least 1 when set",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugrid_core::ErrorKind;

    #[test]
    fn defaults_are_valid() {
        let config = HostConfig::default();
        config.validate().unwrap();
        assert_eq!(config.security_level, SecurityLevel::Standard);
        // Checksum verification must match the validator's own default.
        assert!(config.verify_checksums);
        assert_eq!(config.cache.capacity, 1024);
        assert_eq!(config.bus.queue_capacity, 1024);
    }

    #[test]
    fn toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");

        let mut config = HostConfig::default();
        config.plugin_directories = vec![PathBuf::from("plugins")];
        config.security_level = SecurityLevel::Strict;
        config.cache.capacity = 64;
        config.save(&path).unwrap();

        let back = HostConfig::load(&path).unwrap();
        assert_eq!(back.plugin_directories, vec![PathBuf::from("plugins")]);
        assert_eq!(back.security_level, SecurityLevel::Strict);
        assert_eq!(back.cache.capacity, 64);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: HostConfig = toml::from_str("security_level = \"maximum\"").unwrap();
        assert_eq!(config.security_level, SecurityLevel::Maximum);
        assert_eq!(config.cache.ttl_secs, 300);
    }

    #[test]
    fn zero_capacities_rejected() {
        let mut config = HostConfig::default();
        config.cache.capacity = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);

        let mut config = HostConfig::default();
        config.bus.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let err = HostConfig::load(Path::new("/nonexistent/host.toml")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }
}
