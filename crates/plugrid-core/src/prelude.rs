//! Commonly used plugrid-core exports.

pub use crate::descriptor::{Capabilities, PluginDependency, PluginDescriptor};
pub use crate::error::{ErrorKind, PluginError, PluginResult};
pub use crate::interface::{InterfaceDescriptor, InterfaceRegistry};
pub use crate::plugin::{Document, Plugin, PluginHandle, PluginId, PluginState};
pub use crate::version::{Version, VersionRange};
