//! Plugin lifecycle management: a per-plugin state machine, timed
//! initialization and shutdown, pause/resume, health monitoring,
//! auto-restart, state backup, and lifecycle events.
//!
//! The [`LifecycleManager`] drives every registered plugin through the
//! state machine defined by [`plugrid_core::PluginState`]; callers observe
//! progress through [`LifecycleEvent`] callbacks.
//!
//! [`LifecycleManager`]: crate::manager::LifecycleManager
//! [`LifecycleEvent`]: crate::event::LifecycleEvent

#![warn(missing_docs)]

pub mod config;
pub mod event;
pub mod health;
pub mod manager;
pub mod prelude;

pub use config::LifecycleConfig;
pub use event::{
    CallbackId, EventCallback, EventDispatcher, LifecycleEvent, LifecycleEventKind,
};
pub use health::{HealthCallback, HealthStatus};
pub use manager::{LifecycleManager, LifecycleStatistics};
