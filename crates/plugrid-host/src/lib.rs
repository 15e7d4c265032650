//! The plugrid host: one façade over plugin loading, security
//! validation, lifecycle management, messaging, and composition.
//!
//! [`PluginHost`] is the entry point; [`HostConfig`] configures it,
//! optionally from a TOML file.
//!
//! [`PluginHost`]: crate::host::PluginHost
//! [`HostConfig`]: crate::config::HostConfig

#![warn(missing_docs)]

pub mod config;
pub mod host;
pub mod prelude;

pub use config::{CacheSettings, HostConfig};
pub use host::PluginHost;
