//! Trust store: plugin id to minimum trust level.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use plugrid_core::{Document, PluginError, PluginId, PluginResult};

use crate::level::SecurityLevel;

/// Trust-store document format version.
const TRUST_STORE_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct TrustDocument {
    version: String,
    trusted_plugins: Vec<TrustEntry>,
    // Unknown fields are ignored on load.
}

#[derive(Debug, Serialize, Deserialize)]
struct TrustEntry {
    id: PluginId,
    trust_level: SecurityLevel,
}

/// Maps plugin ids to the trust level granted to them.
#[derive(Default)]
pub struct TrustStore {
    entries: Mutex<HashMap<PluginId, SecurityLevel>>,
}

impl TrustStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant (or update) a plugin's trust level.
    pub fn add_trusted_plugin(&self, id: PluginId, level: SecurityLevel) {
        lock(&self.entries).insert(id, level);
    }

    /// Revoke a plugin's trust. Returns whether it was present.
    pub fn remove_trusted_plugin(&self, id: &PluginId) -> bool {
        lock(&self.entries).remove(id).is_some()
    }

    /// Whether the plugin has any trust entry.
    #[must_use]
    pub fn is_trusted(&self, id: &PluginId) -> bool {
        lock(&self.entries).contains_key(id)
    }

    /// The plugin's granted trust level, if any.
    #[must_use]
    pub fn trust_level(&self, id: &PluginId) -> Option<SecurityLevel> {
        lock(&self.entries).get(id).copied()
    }

    /// Number of trusted plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Serialize to the persistence document.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut trusted_plugins: Vec<TrustEntry> = lock(&self.entries)
            .iter()
            .map(|(id, level)| TrustEntry {
                id: id.clone(),
                trust_level: *level,
            })
            .collect();
        trusted_plugins.sort_by(|a, b| a.id.cmp(&b.id));
        serde_json::to_value(TrustDocument {
            version: TRUST_STORE_VERSION.to_string(),
            trusted_plugins,
        })
        .unwrap_or(Document::Null)
    }

    /// Replace the store contents from a persistence document.
    ///
    /// Unknown fields in the document are ignored.
    pub fn load_document(&self, doc: &Document) -> PluginResult<()> {
        let parsed: TrustDocument = serde_json::from_value(doc.clone())
            .map_err(|e| PluginError::invalid_format(format!("bad trust store document: {e}")))?;
        let mut entries = lock(&self.entries);
        entries.clear();
        for entry in parsed.trusted_plugins {
            entries.insert(entry.id, entry.trust_level);
        }
        Ok(())
    }

    /// Persist to a file as pretty JSON.
    pub fn save(&self, path: &Path) -> PluginResult<()> {
        let doc = self.to_document();
        let text = serde_json::to_string_pretty(&doc)?;
        std::fs::write(path, text).map_err(|e| {
            PluginError::configuration(format!(
                "cannot write trust store {}: {e}",
                path.display()
            ))
        })
    }

    /// Load from a file written by [`save`](Self::save).
    pub fn load(&self, path: &Path) -> PluginResult<()> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PluginError::configuration(format!(
                "cannot read trust store {}: {e}",
                path.display()
            ))
        })?;
        let doc: Document = serde_json::from_str(&text)?;
        self.load_document(&doc)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn grant_query_revoke() {
        let store = TrustStore::new();
        let id = PluginId::from_static("p1");
        assert!(!store.is_trusted(&id));

        store.add_trusted_plugin(id.clone(), SecurityLevel::Strict);
        assert!(store.is_trusted(&id));
        assert_eq!(store.trust_level(&id), Some(SecurityLevel::Strict));

        assert!(store.remove_trusted_plugin(&id));
        assert!(!store.remove_trusted_plugin(&id));
    }

    #[test]
    fn document_round_trip() {
        let store = TrustStore::new();
        store.add_trusted_plugin(PluginId::from_static("a"), SecurityLevel::Basic);
        store.add_trusted_plugin(PluginId::from_static("b"), SecurityLevel::Maximum);

        let doc = store.to_document();
        assert_eq!(doc["version"], "1.0");

        let other = TrustStore::new();
        other.load_document(&doc).unwrap();
        assert_eq!(
            other.trust_level(&PluginId::from_static("b")),
            Some(SecurityLevel::Maximum)
        );
        assert_eq!(other.len(), 2);
    }

    #[test]
    fn unknown_fields_ignored() {
        let store = TrustStore::new();
        let doc = json!({
            "version": "1.0",
            "trusted_plugins": [{ "id": "p1", "trust_level": "standard" }],
            "vendor_extension": { "anything": true },
        });
        store.load_document(&doc).unwrap();
        assert!(store.is_trusted(&PluginId::from_static("p1")));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");
        let store = TrustStore::new();
        store.add_trusted_plugin(PluginId::from_static("p1"), SecurityLevel::Standard);
        store.save(&path).unwrap();

        let other = TrustStore::new();
        other.load(&path).unwrap();
        assert_eq!(
            other.trust_level(&PluginId::from_static("p1")),
            Some(SecurityLevel::Standard)
        );
    }
}
