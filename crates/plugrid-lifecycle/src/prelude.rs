//! Commonly used lifecycle types.

pub use crate::config::LifecycleConfig;
pub use crate::event::{CallbackId, EventCallback, LifecycleEvent, LifecycleEventKind};
pub use crate::health::{HealthCallback, HealthStatus};
pub use crate::manager::{LifecycleManager, LifecycleStatistics};
pub use plugrid_core::prelude::*;
