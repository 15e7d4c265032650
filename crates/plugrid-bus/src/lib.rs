//! In-process communication for plugins: the typed publish/subscribe
//! [`MessageBus`] and the RPC-style [`ServiceRouter`].
//!
//! [`MessageBus`]: crate::bus::MessageBus
//! [`ServiceRouter`]: crate::request::ServiceRouter

#![warn(missing_docs)]

pub mod bus;
pub mod message;
pub mod prelude;
pub mod request;

pub use bus::{
    BusConfig, BusStatistics, MessageBus, MessageFilter, MessageHandler, SubscriptionId,
};
pub use message::{DeliveryMode, Message};
pub use request::{
    AsyncServiceHandler, DEFAULT_REQUEST_TIMEOUT, Request, Response, ResponseStatus,
    RouterStatistics, ServiceRouter, SyncServiceHandler,
};
