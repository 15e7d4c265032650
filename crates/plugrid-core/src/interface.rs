//! Explicit interface registry.
//!
//! Instead of reflective interface discovery, plugins and the host
//! register [`InterfaceDescriptor`] values explicitly and query support
//! with a predicate over the registered set.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::descriptor::Capabilities;
use crate::error::{PluginError, PluginResult};
use crate::version::Version;

/// Describes one interface a component implements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// Stable interface identifier, e.g. `"org.plugrid.codec"`.
    pub id: String,
    /// Interface version.
    pub version: Version,
    /// Capabilities the interface implies.
    #[serde(default, skip_serializing_if = "Capabilities::is_empty")]
    pub capabilities: Capabilities,
}

impl InterfaceDescriptor {
    /// Create a descriptor with no implied capabilities.
    #[must_use]
    pub fn new(id: impl Into<String>, version: Version) -> Self {
        Self {
            id: id.into(),
            version,
            capabilities: Capabilities::NONE,
        }
    }
}

/// Registry of implemented interfaces.
#[derive(Debug, Default)]
pub struct InterfaceRegistry {
    interfaces: RwLock<HashMap<String, InterfaceDescriptor>>,
}

impl InterfaceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interface descriptor.
    ///
    /// Re-registering an ID replaces the previous descriptor (a newer
    /// interface version supersedes the old one).
    pub fn register(&self, descriptor: InterfaceDescriptor) {
        let mut map = self.interfaces.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.insert(descriptor.id.clone(), descriptor);
    }

    /// Remove an interface by ID.
    pub fn unregister(&self, id: &str) -> PluginResult<InterfaceDescriptor> {
        let mut map = self.interfaces.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.remove(id).ok_or_else(|| PluginError::not_found(id))
    }

    /// Whether an interface with at least `min_version` (and the same
    /// major version) is registered.
    #[must_use]
    pub fn supports_interface(&self, id: &str, min_version: &Version) -> bool {
        let map = self.interfaces.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.get(id)
            .is_some_and(|desc| desc.version.compatible_with(min_version))
    }

    /// Fetch a registered descriptor by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<InterfaceDescriptor> {
        let map = self.interfaces.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.get(id).cloned()
    }

    /// All registered descriptors.
    #[must_use]
    pub fn list(&self) -> Vec<InterfaceDescriptor> {
        let map = self.interfaces.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.values().cloned().collect()
    }

    /// Number of registered interfaces.
    #[must_use]
    pub fn len(&self) -> usize {
        let map = self.interfaces.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_query() {
        let registry = InterfaceRegistry::new();
        registry.register(InterfaceDescriptor::new(
            "org.plugrid.codec",
            Version::new(1, 2, 0),
        ));

        assert!(registry.supports_interface("org.plugrid.codec", &Version::new(1, 0, 0)));
        assert!(registry.supports_interface("org.plugrid.codec", &Version::new(1, 2, 0)));
        // Newer requirement than registered.
        assert!(!registry.supports_interface("org.plugrid.codec", &Version::new(1, 3, 0)));
        // Major mismatch.
        assert!(!registry.supports_interface("org.plugrid.codec", &Version::new(2, 0, 0)));
        // Unknown interface.
        assert!(!registry.supports_interface("org.other", &Version::new(1, 0, 0)));
    }

    #[test]
    fn reregister_replaces() {
        let registry = InterfaceRegistry::new();
        registry.register(InterfaceDescriptor::new("iface", Version::new(1, 0, 0)));
        registry.register(InterfaceDescriptor::new("iface", Version::new(1, 5, 0)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("iface").unwrap().version, Version::new(1, 5, 0));
    }

    #[test]
    fn unregister_unknown_fails() {
        let registry = InterfaceRegistry::new();
        assert!(registry.unregister("missing").is_err());
    }
}
