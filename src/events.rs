//! Typed publish/subscribe channel between the core and its consumers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::device::ConnectionState;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A single connection state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkEvent {
    StatusChanged(StatusChange),
    LineReceived {
        raw: String,
        received_at: DateTime<Utc>,
    },
    DecodeFailed {
        raw: String,
        error: String,
    },
    /// Required fields missing; the reading was discarded.
    ReadingDropped {
        reason: String,
    },
    /// Carries the values as they were before encryption.
    Inserted {
        table: String,
        id: i64,
        values: Map<String, Value>,
    },
    InsertFailed {
        table: String,
        error: String,
    },
    DataSent {
        bytes: usize,
    },
    PortSwitched {
        from: Option<String>,
        to: String,
    },
}

/// Cloneable handle to the event channel. Slow subscribers lose the oldest
/// events instead of blocking publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LinkEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: LinkEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
