//! Plugin composition: pure [`Composition`] descriptions and the
//! [`CompositePlugin`] that materializes them over live plugin handles.
//!
//! [`Composition`]: crate::composition::Composition
//! [`CompositePlugin`]: crate::composite::CompositePlugin

#![warn(missing_docs)]

pub mod composite;
pub mod composition;
pub mod prelude;

pub use composite::CompositePlugin;
pub use composition::{
    Composition, CompositionMember, CompositionStrategy, MethodBinding, PluginRole,
};
