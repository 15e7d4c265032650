//! An image backend serving mock plugins from plain files.
//!
//! Loader and host tests register metadata for paths they create on disk;
//! opening one of those paths yields a [`MockPlugin`] built from that
//! metadata. Everything the real dylib backend does (metadata extraction,
//! interface IDs, instantiation, failure modes) can be scripted without
//! compiling a native image.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;

use plugrid_core::{Document, PluginDescriptor, PluginError, PluginHandle, PluginResult};
use plugrid_loader::{ImageBackend, ImageHandle};

use crate::mock::MockPlugin;

/// Metadata key the fake backend reads to delay instantiation.
const LOAD_DELAY_KEY: &str = "__load_delay_ms";

/// A well-formed metadata document for tests.
#[must_use]
pub fn fake_metadata(id: &str, name: &str, version: &str) -> Document {
    json!({ "id": id, "name": name, "version": version })
}

/// Metadata whose instantiation blocks for `delay`.
#[must_use]
pub fn slow_load_metadata(id: &str, delay: Duration) -> Document {
    json!({
        "id": id,
        "name": id,
        "version": "1.0.0",
        LOAD_DELAY_KEY: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
    })
}

#[derive(Clone)]
enum FakeEntry {
    Image {
        metadata: Document,
        interface_id: Option<String>,
    },
    BrokenMetadata,
}

/// The backend. Cheap to clone; clones share the registry, so tests can
/// keep a handle after moving a clone into a loader.
#[derive(Clone, Default)]
pub struct FakeImageBackend {
    images: Arc<DashMap<PathBuf, FakeEntry>>,
}

impl FakeImageBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a fake image file into `dir` and register its metadata.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn install(&self, dir: &Path, file_name: &str, metadata: Document) -> PathBuf {
        self.install_entry(
            dir,
            file_name,
            FakeEntry::Image {
                metadata,
                interface_id: None,
            },
        )
    }

    /// Like [`install`](Self::install), with an embedded interface ID.
    pub fn install_with_interface(
        &self,
        dir: &Path,
        file_name: &str,
        metadata: Document,
        interface_id: &str,
    ) -> PathBuf {
        self.install_entry(
            dir,
            file_name,
            FakeEntry::Image {
                metadata,
                interface_id: Some(interface_id.to_string()),
            },
        )
    }

    /// Write a fake image whose metadata does not parse.
    pub fn install_broken(&self, dir: &Path, file_name: &str) -> PathBuf {
        self.install_entry(dir, file_name, FakeEntry::BrokenMetadata)
    }

    fn install_entry(&self, dir: &Path, file_name: &str, entry: FakeEntry) -> PathBuf {
        let path = dir.join(file_name);
        std::fs::write(&path, b"fake plugin image").expect("write fake image file");
        self.images.insert(path.clone(), entry);
        path
    }
}

impl ImageBackend for FakeImageBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn can_open(&self, path: &Path) -> bool {
        self.images.contains_key(path)
    }

    fn open(&self, path: &Path) -> PluginResult<Box<dyn ImageHandle>> {
        let entry = self
            .images
            .get(path)
            .map(|e| e.clone())
            .ok_or_else(|| PluginError::file_not_found(path.display()))?;
        Ok(Box::new(FakeImage {
            entry,
            path: path.to_path_buf(),
        }))
    }
}

struct FakeImage {
    entry: FakeEntry,
    path: PathBuf,
}

impl ImageHandle for FakeImage {
    fn metadata(&self) -> PluginResult<Document> {
        match &self.entry {
            FakeEntry::Image { metadata, .. } => Ok(metadata.clone()),
            FakeEntry::BrokenMetadata => Err(PluginError::invalid_format(format!(
                "image {} has malformed metadata",
                self.path.display()
            ))),
        }
    }

    fn interface_id(&self) -> Option<String> {
        match &self.entry {
            FakeEntry::Image { interface_id, .. } => interface_id.clone(),
            FakeEntry::BrokenMetadata => None,
        }
    }

    fn instantiate(&self) -> PluginResult<PluginHandle> {
        let raw = self.metadata()?;
        if let Some(ms) = raw.get(LOAD_DELAY_KEY).and_then(Document::as_u64) {
            std::thread::sleep(Duration::from_millis(ms));
        }
        let descriptor = PluginDescriptor::from_document(&raw, self.interface_id().as_deref())?;
        Ok(Arc::new(MockPlugin::from_descriptor(descriptor)))
    }
}
