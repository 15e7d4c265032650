//! Core types and the plugin contract for the plugrid host runtime.
//!
//! This crate defines the vocabulary shared by every host subsystem:
//! the error model ([`PluginError`]/[`PluginResult`]), semantic versions,
//! normalized plugin metadata ([`PluginDescriptor`]), lifecycle states,
//! and the [`Plugin`] contract every loadable unit implements.
//!
//! [`PluginError`]: crate::error::PluginError
//! [`PluginResult`]: crate::error::PluginResult
//! [`PluginDescriptor`]: crate::descriptor::PluginDescriptor
//! [`Plugin`]: crate::plugin::Plugin

#![warn(missing_docs)]

pub mod descriptor;
pub mod error;
pub mod interface;
pub mod plugin;
pub mod prelude;
pub mod version;

pub use descriptor::{Capabilities, PluginDependency, PluginDescriptor};
pub use error::{ErrorKind, PluginError, PluginResult};
pub use interface::{InterfaceDescriptor, InterfaceRegistry};
pub use plugin::{Document, Plugin, PluginHandle, PluginId, PluginState};
pub use version::{Version, VersionRange};
