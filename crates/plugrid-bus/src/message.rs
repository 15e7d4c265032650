//! Message envelope and delivery modes.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use plugrid_core::Document;

/// Process-wide monotonic sequence for message ordering.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// What the bus guarantees for one publication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Queued per subscriber; the publisher waits (bounded) when a
    /// subscriber queue is full.
    #[default]
    Reliable,
    /// Best effort; the oldest queued item is dropped under backpressure.
    Fast,
    /// Delivered to every subscriber of the type, ignoring filters.
    Broadcast,
}

/// One message on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Type tag subscribers key on.
    pub message_type: String,
    /// Who published it.
    pub sender: String,
    /// Monotonic publication order, process-wide.
    pub sequence: u64,
    /// Wall-clock time of construction.
    pub timestamp: DateTime<Utc>,
    /// The payload.
    pub payload: Document,
}

impl Message {
    /// Build a message, stamping it with the next monotonic sequence.
    #[must_use]
    pub fn new(
        message_type: impl Into<String>,
        sender: impl Into<String>,
        payload: Document,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            sender: sender.into(),
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequence_is_monotonic() {
        let a = Message::new("event", "s", json!({}));
        let b = Message::new("event", "s", json!({}));
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn delivery_mode_serde_names() {
        assert_eq!(
            serde_json::to_string(&DeliveryMode::Reliable).unwrap(),
            "\"reliable\""
        );
        let back: DeliveryMode = serde_json::from_str("\"fast\"").unwrap();
        assert_eq!(back, DeliveryMode::Fast);
    }
}
