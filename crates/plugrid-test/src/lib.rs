//! Shared test fixtures for the plugrid workspace.
//!
//! Provides [`MockPlugin`], a fully scriptable in-process plugin, and
//! [`FakeImageBackend`], an image backend that serves mock plugins from
//! plain files so loader and host behavior can be exercised without
//! compiling native images.

pub mod backend;
pub mod mock;

pub use backend::{FakeImageBackend, fake_metadata, slow_load_metadata};
pub use mock::{MockPlugin, MockPluginBuilder};
