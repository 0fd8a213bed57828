//! Event Buffer
//!
//! In-memory accumulator between the collector-facing API and the
//! dispatch path. Events are staged under one mutex; a flush swaps the
//! accumulator out and hands the drained batch to the dispatch channel
//! outside the critical section, so `store` never blocks on network I/O.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use relay_types::{EventBatch, RawEvent};

use crate::dispatcher::Inflight;

/// Buffer thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum events staged before a flush
    pub record_limit: usize,
    /// Maximum payload bytes staged before a flush
    pub byte_limit: usize,
    /// Maximum age of the oldest staged event, in milliseconds
    pub time_limit_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            record_limit: 500,
            byte_limit: 5_000_000,
            time_limit_ms: 5_000,
        }
    }
}

impl BufferConfig {
    /// Time limit as a duration
    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }

    /// Validate the thresholds
    pub fn validate(&self) -> Result<(), String> {
        if self.record_limit == 0 {
            return Err("buffer record_limit must be greater than 0".to_string());
        }
        if self.byte_limit == 0 {
            return Err("buffer byte_limit must be greater than 0".to_string());
        }
        if self.time_limit_ms == 0 {
            return Err("buffer time_limit_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

struct BufferState {
    events: Vec<RawEvent>,
    bytes: usize,
    last_flushed_at: Instant,
}

/// Thread-safe accumulator with count, byte and time flush triggers.
pub(crate) struct EventBuffer {
    config: BufferConfig,
    state: Mutex<BufferState>,
    outbox: mpsc::UnboundedSender<EventBatch>,
    inflight: Arc<Inflight>,
}

impl EventBuffer {
    pub fn new(
        config: BufferConfig,
        outbox: mpsc::UnboundedSender<EventBatch>,
        inflight: Arc<Inflight>,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(BufferState {
                events: Vec::new(),
                bytes: 0,
                last_flushed_at: Instant::now(),
            }),
            outbox,
            inflight,
        }
    }

    /// Stage one event. If appending it would exceed the record or byte
    /// threshold, the current contents are flushed first; the new event
    /// always ends up staged.
    pub fn store(&self, event: RawEvent) {
        let drained = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let size = event.size();
            let over_limit = state.events.len() + 1 > self.config.record_limit
                || state.bytes + size > self.config.byte_limit;
            let drained = if over_limit { Self::drain(&mut state) } else { None };
            state.events.push(event);
            state.bytes += size;
            drained
        };

        if let Some(events) = drained {
            self.hand_off(events);
        }
    }

    /// Drain everything staged into one batch and hand it to the
    /// dispatch path. Empty flushes are no-ops.
    pub fn flush(&self) {
        let drained = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            Self::drain(&mut state)
        };

        if let Some(events) = drained {
            self.hand_off(events);
        }
    }

    /// Time elapsed since the last non-empty flush.
    pub fn time_since_flush(&self) -> Duration {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_flushed_at.elapsed()
    }

    fn drain(state: &mut BufferState) -> Option<Vec<RawEvent>> {
        if state.events.is_empty() {
            return None;
        }
        state.bytes = 0;
        state.last_flushed_at = Instant::now();
        Some(std::mem::take(&mut state.events))
    }

    fn hand_off(&self, events: Vec<RawEvent>) {
        let batch = EventBatch::new(events);
        debug!(
            "flushing batch {} ({} records, {} bytes)",
            batch.batch_id,
            batch.len(),
            batch.byte_size()
        );
        self.inflight.incr();
        if let Err(e) = self.outbox.send(batch) {
            self.inflight.decr();
            warn!("dispatcher is gone, dropping {} records", e.0.len());
        }
    }
}

/// Self-rescheduling periodic flush: each pass re-arms for the remainder
/// of the time limit, so any staged event is flushed within at most two
/// time limits regardless of arrival rate.
pub(crate) fn spawn_flush_schedule(
    buffer: Arc<EventBuffer>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let time_limit = buffer.config.time_limit();
    tokio::spawn(async move {
        loop {
            let elapsed = buffer.time_since_flush();
            let wait = if elapsed >= time_limit {
                buffer.flush();
                time_limit
            } else {
                time_limit - elapsed
            };

            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.changed() => {
                    debug!("flush schedule stopped");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(
        record_limit: usize,
        byte_limit: usize,
    ) -> (EventBuffer, mpsc::UnboundedReceiver<EventBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = BufferConfig {
            record_limit,
            byte_limit,
            time_limit_ms: 60_000,
        };
        (EventBuffer::new(config, tx, Arc::new(Inflight::new())), rx)
    }

    fn event(bytes: usize) -> RawEvent {
        RawEvent::new(vec![0u8; bytes], "key")
    }

    #[test]
    fn test_config_validation() {
        assert!(BufferConfig::default().validate().is_ok());
        let bad = BufferConfig {
            record_limit: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_record_limit_triggers_flush_on_next_store() {
        let (buffer, mut rx) = buffer_with(3, 1_000);

        for _ in 0..4 {
            buffer.store(event(200));
        }

        // The fourth arrival pushed out the first three
        let batch = rx.try_recv().expect("a flush should have happened");
        assert_eq!(batch.len(), 3);
        assert!(rx.try_recv().is_err());

        // The fourth event is still staged
        buffer.flush();
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_byte_limit_triggers_flush_on_next_store() {
        let (buffer, mut rx) = buffer_with(100, 500);

        buffer.store(event(400));
        buffer.store(event(200));

        let batch = rx.try_recv().expect("byte threshold flush");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.byte_size(), 400);

        buffer.flush();
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.byte_size(), 200);
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let (buffer, mut rx) = buffer_with(10, 1_000);
        buffer.flush();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_every_stored_event_is_flushed_exactly_once() {
        let (buffer, mut rx) = buffer_with(7, 900);

        let stored: Vec<RawEvent> = (0..50)
            .map(|i| RawEvent::new(vec![i as u8; (i % 13) * 20 + 1], format!("key-{}", i)))
            .collect();
        for e in &stored {
            buffer.store(e.clone());
        }
        buffer.flush();

        let mut seen = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            assert!(batch.len() <= 7);
            seen.extend(batch.events);
        }
        assert_eq!(seen, stored);
    }

    #[tokio::test]
    async fn test_oversized_single_event_stages_anyway() {
        // Caller-enforced precondition: an event above the byte limit is
        // still staged (an empty flush precedes it and is a no-op).
        let (buffer, mut rx) = buffer_with(10, 100);
        buffer.store(event(500));
        assert!(rx.try_recv().is_err());

        buffer.flush();
        assert_eq!(rx.try_recv().unwrap().byte_size(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush_fires_after_time_limit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = BufferConfig {
            record_limit: 100,
            byte_limit: 10_000,
            time_limit_ms: 1_000,
        };
        let buffer = Arc::new(EventBuffer::new(config, tx, Arc::new(Inflight::new())));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_flush_schedule(buffer.clone(), shutdown_rx);

        buffer.store(event(10));
        tokio::time::sleep(Duration::from_millis(2_100)).await;

        let batch = rx.try_recv().expect("time-based flush");
        assert_eq!(batch.len(), 1);

        handle.abort();
    }
}
