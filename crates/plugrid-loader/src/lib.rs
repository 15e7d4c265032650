//! Plugin image discovery, metadata caching, and load/unload.
//!
//! The [`PluginLoader`] is the only component that touches native plugin
//! images. It discovers candidate files, normalizes their embedded
//! metadata through a validity-checked [`MetadataCache`], and owns every
//! loaded image together with the shared instance it backs.
//!
//! [`PluginLoader`]: crate::loader::PluginLoader
//! [`MetadataCache`]: crate::cache::MetadataCache

#![warn(missing_docs)]

pub mod cache;
pub mod image;
pub mod loader;
pub mod prelude;

pub use cache::{CacheStats, MetadataCache, spawn_periodic_save};
pub use image::{DylibBackend, IMAGE_EXTENSIONS, ImageBackend, ImageHandle, has_image_extension};
pub use loader::{ErrorRecord, LoadedPlugin, PluginLoader, PluginLoaderBuilder, PoolStats, ResourceUsage};
