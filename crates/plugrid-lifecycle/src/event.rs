//! Lifecycle events and the callback registry.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use plugrid_core::{Document, ErrorKind, PluginId, PluginState};

/// What a lifecycle event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    /// `initialize` is about to run.
    BeforeInitialize,
    /// `initialize` returned (the event carries the error, if any).
    AfterInitialize,
    /// `shutdown` is about to run.
    BeforeShutdown,
    /// `shutdown` returned.
    AfterShutdown,
    /// The state machine moved.
    StateChanged,
    /// A lifecycle operation failed.
    Error,
    /// A timed operation overran its budget.
    Timeout,
    /// Health flipped between healthy and unhealthy.
    HealthCheck,
    /// Resource metrics crossed a threshold.
    ResourceWarning,
}

/// One lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// The plugin the event is about.
    pub plugin_id: PluginId,
    /// Event classification.
    pub kind: LifecycleEventKind,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// State before, for `StateChanged`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_state: Option<PluginState>,
    /// State after, for `StateChanged`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<PluginState>,
    /// Error classification when the event reports a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    /// Free-form detail.
    #[serde(skip_serializing_if = "Document::is_null")]
    pub details: Document,
}

impl LifecycleEvent {
    /// A plain event with no state or error payload.
    #[must_use]
    pub fn new(plugin_id: PluginId, kind: LifecycleEventKind) -> Self {
        Self {
            plugin_id,
            kind,
            timestamp: Utc::now(),
            old_state: None,
            new_state: None,
            error: None,
            details: Document::Null,
        }
    }

    /// Attach a state change.
    #[must_use]
    pub fn with_states(mut self, old: PluginState, new: PluginState) -> Self {
        self.old_state = Some(old);
        self.new_state = Some(new);
        self
    }

    /// Attach an error classification.
    #[must_use]
    pub fn with_error(mut self, error: ErrorKind) -> Self {
        self.error = Some(error);
        self
    }

    /// Attach free-form details.
    #[must_use]
    pub fn with_details(mut self, details: Document) -> Self {
        self.details = details;
        self
    }
}

/// Callback invoked for matching lifecycle events.
pub type EventCallback = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Handle to a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackId(u64);

struct CallbackEntry {
    plugin_filter: Option<PluginId>,
    kind_filter: Option<LifecycleEventKind>,
    callback: EventCallback,
}

/// Fan-out registry for lifecycle event callbacks.
///
/// Panics thrown by a callback are caught and logged; a broken callback
/// never takes the dispatcher down or starves other callbacks.
#[derive(Default)]
pub struct EventDispatcher {
    callbacks: RwLock<HashMap<u64, CallbackEntry>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback, optionally filtered by plugin and event kind.
    pub fn register(
        &self,
        plugin_filter: Option<PluginId>,
        kind_filter: Option<LifecycleEventKind>,
        callback: EventCallback,
    ) -> CallbackId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        write(&self.callbacks).insert(
            id,
            CallbackEntry {
                plugin_filter,
                kind_filter,
                callback,
            },
        );
        CallbackId(id)
    }

    /// Remove a callback. Returns whether it was present.
    pub fn unregister(&self, id: CallbackId) -> bool {
        write(&self.callbacks).remove(&id.0).is_some()
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.callbacks).len()
    }

    /// Whether no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        read(&self.callbacks).is_empty()
    }

    /// Deliver an event to every matching callback.
    pub fn emit(&self, event: &LifecycleEvent) {
        let matching: Vec<EventCallback> = read(&self.callbacks)
            .values()
            .filter(|entry| {
                entry
                    .plugin_filter
                    .as_ref()
                    .is_none_or(|id| *id == event.plugin_id)
                    && entry.kind_filter.is_none_or(|k| k == event.kind)
            })
            .map(|entry| Arc::clone(&entry.callback))
            .collect();
        for callback in matching {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
            if result.is_err() {
                warn!(
                    plugin_id = %event.plugin_id,
                    kind = ?event.kind,
                    "Lifecycle event callback panicked; continuing"
                );
            }
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("callbacks", &self.len())
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collect() -> (EventCallback, Arc<Mutex<Vec<LifecycleEventKind>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: EventCallback = Arc::new(move |event: &LifecycleEvent| {
            sink.lock().unwrap().push(event.kind);
        });
        (callback, seen)
    }

    #[test]
    fn filters_by_plugin_and_kind() {
        let dispatcher = EventDispatcher::new();
        let (callback, seen) = collect();
        dispatcher.register(
            Some(PluginId::from_static("p1")),
            Some(LifecycleEventKind::StateChanged),
            callback,
        );

        dispatcher.emit(&LifecycleEvent::new(
            PluginId::from_static("p1"),
            LifecycleEventKind::StateChanged,
        ));
        dispatcher.emit(&LifecycleEvent::new(
            PluginId::from_static("p2"),
            LifecycleEventKind::StateChanged,
        ));
        dispatcher.emit(&LifecycleEvent::new(
            PluginId::from_static("p1"),
            LifecycleEventKind::Error,
        ));

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn unfiltered_callback_sees_everything() {
        let dispatcher = EventDispatcher::new();
        let (callback, seen) = collect();
        dispatcher.register(None, None, callback);

        for kind in [
            LifecycleEventKind::BeforeInitialize,
            LifecycleEventKind::AfterInitialize,
            LifecycleEventKind::HealthCheck,
        ] {
            dispatcher.emit(&LifecycleEvent::new(PluginId::from_static("p"), kind));
        }
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn unregister_stops_delivery() {
        let dispatcher = EventDispatcher::new();
        let (callback, seen) = collect();
        let id = dispatcher.register(None, None, callback);
        assert!(dispatcher.unregister(id));
        assert!(!dispatcher.unregister(id));

        dispatcher.emit(&LifecycleEvent::new(
            PluginId::from_static("p"),
            LifecycleEventKind::Error,
        ));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_callback_does_not_starve_others() {
        let dispatcher = EventDispatcher::new();
        dispatcher.register(None, None, Arc::new(|_| panic!("boom")));
        let (callback, seen) = collect();
        dispatcher.register(None, None, callback);

        dispatcher.emit(&LifecycleEvent::new(
            PluginId::from_static("p"),
            LifecycleEventKind::Error,
        ));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
