//! Commonly used composition types.

pub use crate::composite::CompositePlugin;
pub use crate::composition::{Composition, CompositionStrategy, MethodBinding, PluginRole};
pub use plugrid_core::prelude::*;
