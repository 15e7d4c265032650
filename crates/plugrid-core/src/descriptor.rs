//! Plugin descriptors: normalized metadata extracted from a plugin's
//! embedded metadata document.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};
use crate::plugin::{Document, PluginId};
use crate::version::{Version, VersionRange};

/// Capability flag bitset declared by a plugin.
///
/// Serialized as a list of capability names so metadata documents stay
/// readable; the in-memory form is a plain bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Capabilities(u32);

impl Capabilities {
    /// No capabilities.
    pub const NONE: Self = Self(0);
    /// Provides user-facing surfaces.
    pub const UI: Self = Self(1);
    /// Runs a long-lived background service.
    pub const SERVICE: Self = Self(1 << 1);
    /// Performs network I/O.
    pub const NETWORK: Self = Self(1 << 2);
    /// Transforms data as part of a processing chain.
    pub const DATA_PROCESSING: Self = Self(1 << 3);
    /// Hosts scripted logic via a bridge.
    pub const SCRIPTING: Self = Self(1 << 4);
    /// Reads or writes the file system.
    pub const FILE_SYSTEM: Self = Self(1 << 5);
    /// Supports asynchronous initialization.
    pub const ASYNC_INIT: Self = Self(1 << 6);
    /// Supports hot reload.
    pub const HOT_RELOAD: Self = Self(1 << 7);
    /// Accepts runtime configuration.
    pub const CONFIGURATION: Self = Self(1 << 8);
    /// Supports cooperative state migration.
    pub const STATE_MIGRATION: Self = Self(1 << 9);

    const NAMES: [(Self, &'static str); 10] = [
        (Self::UI, "ui"),
        (Self::SERVICE, "service"),
        (Self::NETWORK, "network"),
        (Self::DATA_PROCESSING, "data_processing"),
        (Self::SCRIPTING, "scripting"),
        (Self::FILE_SYSTEM, "file_system"),
        (Self::ASYNC_INIT, "async_init"),
        (Self::HOT_RELOAD, "hot_reload"),
        (Self::CONFIGURATION, "configuration"),
        (Self::STATE_MIGRATION, "state_migration"),
    ];

    /// Whether all flags in `other` are set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags in `other`.
    #[must_use]
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether no flags are set.
    ///
    /// Takes a reference so it doubles as a serde `skip_serializing_if`
    /// predicate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The raw bit pattern.
    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Look up a single flag by its serialized name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(flag, _)| *flag)
    }

    fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join("|"))
    }
}

impl Serialize for Capabilities {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        let mut caps = Self::NONE;
        for name in &names {
            match Self::from_name(name) {
                Some(flag) => caps = caps.with(flag),
                None => {
                    return Err(serde::de::Error::custom(format!(
                        "unknown capability: {name}"
                    )));
                },
            }
        }
        Ok(caps)
    }
}

/// A dependency a plugin declares on another plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDependency {
    /// The plugin this dependency refers to.
    pub id: PluginId,
    /// Acceptable version range.
    #[serde(default)]
    pub version: VersionRange,
    /// Whether the host may proceed without this dependency.
    #[serde(default)]
    pub optional: bool,
}

/// Normalized plugin metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique plugin identifier.
    pub id: PluginId,
    /// Human-readable display name.
    pub name: String,
    /// Semantic version.
    pub version: Version,
    /// Author or vendor.
    #[serde(default)]
    pub author: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// License identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Category used for grouping in listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Declared capability flags.
    #[serde(default, skip_serializing_if = "Capabilities::is_empty")]
    pub capabilities: Capabilities,
    /// Declared dependencies on other plugins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PluginDependency>,
    /// Free-form fields carried through from the metadata document
    /// (checksum, permissions, and anything vendor-specific).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, Document>,
}

impl PluginDescriptor {
    /// Build a minimal descriptor; used by tests and mock plugins.
    pub fn minimal(id: &str, name: &str, version: Version) -> PluginResult<Self> {
        Ok(Self {
            id: PluginId::new(id)?,
            name: name.to_string(),
            version,
            author: String::new(),
            description: None,
            license: None,
            category: None,
            capabilities: Capabilities::NONE,
            dependencies: Vec::new(),
            custom: BTreeMap::new(),
        })
    }

    /// Normalize a raw metadata document into a descriptor.
    ///
    /// The plugin ID is taken from the `id` field; if absent it is derived
    /// from `name`; if that fails too, `fallback_id` (the image's embedded
    /// interface ID) is used. Unknown fields are preserved in `custom`.
    pub fn from_document(raw: &Document, fallback_id: Option<&str>) -> PluginResult<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| PluginError::invalid_format("metadata document must be an object"))?;

        let name = obj
            .get("name")
            .and_then(Document::as_str)
            .unwrap_or_default()
            .to_string();

        let id = match obj.get("id").and_then(Document::as_str) {
            Some(id) => PluginId::new(id)?,
            None => PluginId::from_name(&name)
                .or_else(|e| match fallback_id {
                    Some(fallback) => PluginId::new(fallback),
                    None => Err(e),
                })
                .map_err(|_| {
                    PluginError::invalid_format("metadata has no usable id, name, or interface id")
                })?,
        };

        let version = match obj.get("version").and_then(Document::as_str) {
            Some(s) => Version::parse(s)?,
            None => Version::new(0, 0, 0),
        };

        let capabilities = match obj.get("capabilities") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| PluginError::invalid_format(format!("bad capabilities: {e}")))?,
            None => Capabilities::NONE,
        };

        let dependencies = match obj.get("dependencies") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| PluginError::invalid_format(format!("bad dependencies: {e}")))?,
            None => Vec::new(),
        };

        let known = [
            "id",
            "name",
            "version",
            "author",
            "description",
            "license",
            "category",
            "capabilities",
            "dependencies",
        ];
        let custom: BTreeMap<String, Document> = obj
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let get_str =
            |key: &str| obj.get(key).and_then(Document::as_str).map(str::to_string);

        Ok(Self {
            id,
            name,
            version,
            author: get_str("author").unwrap_or_default(),
            description: get_str("description"),
            license: get_str("license"),
            category: get_str("category"),
            capabilities,
            dependencies,
            custom,
        })
    }

    /// Serialize back into a metadata document.
    #[must_use]
    pub fn to_document(&self) -> Document {
        serde_json::to_value(self).unwrap_or(Document::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capabilities_bitset_ops() {
        let caps = Capabilities::SERVICE | Capabilities::NETWORK;
        assert!(caps.contains(Capabilities::SERVICE));
        assert!(caps.contains(Capabilities::NETWORK));
        assert!(!caps.contains(Capabilities::UI));
        assert!(caps.contains(Capabilities::NONE));
        assert_eq!(caps.to_string(), "service|network");
    }

    #[test]
    fn capabilities_serde_round_trip() {
        let caps = Capabilities::UI | Capabilities::HOT_RELOAD;
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, "[\"ui\",\"hot_reload\"]");
        let back: Capabilities = serde_json::from_str(&json).unwrap();
        assert_eq!(back, caps);
    }

    #[test]
    fn empty_capabilities_are_skipped_in_serialization() {
        let desc = PluginDescriptor::minimal("p1", "P1", Version::new(1, 0, 0)).unwrap();
        let doc = desc.to_document();
        assert!(doc.get("capabilities").is_none());

        let caps = Capabilities::NONE;
        assert!(Capabilities::is_empty(&caps));
    }

    #[test]
    fn capabilities_rejects_unknown_name() {
        assert!(serde_json::from_str::<Capabilities>("[\"telepathy\"]").is_err());
    }

    #[test]
    fn from_document_full() {
        let raw = json!({
            "id": "image-codec",
            "name": "Image Codec",
            "version": "1.2.3",
            "author": "example",
            "license": "MIT",
            "category": "codecs",
            "capabilities": ["service", "data_processing"],
            "dependencies": [
                { "id": "core-utils", "version": "^1.0.0" },
                { "id": "extras", "version": "*", "optional": true }
            ],
            "checksum": "abc123",
        });
        let desc = PluginDescriptor::from_document(&raw, None).unwrap();
        assert_eq!(desc.id.as_str(), "image-codec");
        assert_eq!(desc.version, Version::new(1, 2, 3));
        assert!(desc.capabilities.contains(Capabilities::SERVICE));
        assert_eq!(desc.dependencies.len(), 2);
        assert!(desc.dependencies[1].optional);
        assert_eq!(desc.custom.get("checksum"), Some(&json!("abc123")));
    }

    #[test]
    fn from_document_derives_id_from_name() {
        let raw = json!({ "name": "My Filter", "version": "0.1.0" });
        let desc = PluginDescriptor::from_document(&raw, None).unwrap();
        assert_eq!(desc.id.as_str(), "my-filter");
    }

    #[test]
    fn from_document_falls_back_to_interface_id() {
        let raw = json!({ "name": "!!!", "version": "0.1.0" });
        let desc = PluginDescriptor::from_document(&raw, Some("org.example.iface")).unwrap();
        assert_eq!(desc.id.as_str(), "org.example.iface");
    }

    #[test]
    fn from_document_rejects_non_object() {
        assert!(PluginDescriptor::from_document(&json!([1, 2]), None).is_err());
        assert!(PluginDescriptor::from_document(&json!("x"), None).is_err());
    }

    #[test]
    fn descriptor_serde_round_trip() {
        let raw = json!({
            "id": "p1",
            "name": "P1",
            "version": "1.0.0",
            "author": "t",
        });
        let desc = PluginDescriptor::from_document(&raw, None).unwrap();
        let doc = desc.to_document();
        let back: PluginDescriptor = serde_json::from_value(doc).unwrap();
        assert_eq!(back, desc);
    }
}
