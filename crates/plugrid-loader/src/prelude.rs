//! Commonly used loader types.

pub use crate::cache::{CacheStats, MetadataCache};
pub use crate::image::{DylibBackend, ImageBackend, ImageHandle};
pub use crate::loader::{LoadedPlugin, PluginLoader, PluginLoaderBuilder, ResourceUsage};
pub use plugrid_core::prelude::*;
