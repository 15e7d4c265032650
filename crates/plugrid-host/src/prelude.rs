//! Commonly used host types.

pub use crate::config::HostConfig;
pub use crate::host::PluginHost;
pub use plugrid_core::prelude::*;
