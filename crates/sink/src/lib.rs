//! Event Relay Sink
//!
//! Dual-destination streaming sink for collected events: batches are
//! coalesced in memory and forwarded to a Kinesis stream, spilling over
//! to an SQS queue while the stream is unhealthy. Failed records are
//! retried with randomized adaptive backoff, destinations are probed back
//! to health in the background, and the combined health is exported for
//! the collector's readiness endpoint.

pub mod buffer;
pub mod config;
mod dispatcher;
pub mod health;
pub mod kinesis;
pub mod retry;
pub mod sink;
pub mod splitter;
pub mod sqs;
pub mod telemetry;

pub use buffer::BufferConfig;
pub use config::{ConfigError, SinkConfig};
pub use health::{ComponentHealth, HealthReport, HealthStatus};
pub use kinesis::{
    KinesisStreamClient, RecordOutcome, StreamClient, StreamClientError, ACTIVE_STREAM_STATUS,
};
pub use retry::{next_backoff, BackoffPolicy};
pub use sink::{EventSink, EventSinkBuilder, SinkError, SinkStats};
pub use splitter::split_batch;
pub use sqs::{
    QueueClient, QueueClientError, QueueEntry, QueueFailure, SqsQueueClient,
    KINESIS_KEY_ATTRIBUTE, MAX_QUEUE_BATCH_ENTRIES,
};
pub use telemetry::{SinkMetrics, TelemetryConfig, TelemetryError, TelemetryProvider};

pub use relay_types::{EventBatch, RawEvent};
