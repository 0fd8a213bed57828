//! Event Types
//!
//! This module defines the raw event record accepted from the collector
//! and the batch wrapper used as the unit of submission downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single collected event: an opaque payload plus the partition key the
/// primary stream shards on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawEvent {
    /// Serialized event payload; the sink never inspects it
    pub payload: Vec<u8>,
    /// Partition key for the primary stream
    pub key: String,
}

impl RawEvent {
    /// Create a new raw event
    pub fn new(payload: Vec<u8>, key: impl Into<String>) -> Self {
        Self {
            payload,
            key: key.into(),
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// An ordered batch of events, the unit handed from the buffer to the
/// dispatch path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    /// Batch ID for log correlation
    pub batch_id: Uuid,
    /// When the batch was drained out of the buffer
    pub created_at: DateTime<Utc>,
    /// Events in arrival order
    pub events: Vec<RawEvent>,
}

impl EventBatch {
    /// Create a new batch
    pub fn new(events: Vec<RawEvent>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            created_at: Utc::now(),
            events,
        }
    }

    /// Number of events in the batch
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total payload bytes across the batch
    pub fn byte_size(&self) -> usize {
        self.events.iter().map(RawEvent::size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_size() {
        let event = RawEvent::new(vec![0u8; 128], "key-1");
        assert_eq!(event.size(), 128);
        assert_eq!(event.key, "key-1");
    }

    #[test]
    fn test_batch_accounting() {
        let batch = EventBatch::new(vec![
            RawEvent::new(vec![0u8; 100], "a"),
            RawEvent::new(vec![0u8; 250], "b"),
        ]);

        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
        assert_eq!(batch.byte_size(), 350);
    }

    #[test]
    fn test_empty_batch() {
        let batch = EventBatch::new(Vec::new());
        assert!(batch.is_empty());
        assert_eq!(batch.byte_size(), 0);
    }

    #[test]
    fn test_event_serialization_round_trip() {
        let event = RawEvent::new(b"payload".to_vec(), "session-42");
        let json = serde_json::to_vec(&event).unwrap();
        let back: RawEvent = serde_json::from_slice(&json).unwrap();
        assert_eq!(event, back);
    }
}
