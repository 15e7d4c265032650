//! Commonly used bus types.

pub use crate::bus::{BusConfig, MessageBus, MessageFilter, MessageHandler, SubscriptionId};
pub use crate::message::{DeliveryMode, Message};
pub use crate::request::{Request, Response, ResponseStatus, ServiceRouter};
pub use plugrid_core::prelude::*;
