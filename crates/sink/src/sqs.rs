//! SQS Queue Client
//!
//! The secondary-destination seam: a trait over the send-message-batch
//! and queue-url lookup primitives, plus the AWS SQS implementation. The
//! queue carries base64-encoded payloads and preserves the stream
//! partition key in a message attribute so a downstream drainer can
//! replay entries onto the stream.

use async_trait::async_trait;
use aws_sdk_sqs::types::{MessageAttributeValue, SendMessageBatchRequestEntry};
use thiserror::Error;
use tracing::debug;

use crate::config::SinkConfig;

/// Message attribute carrying the original stream partition key
pub const KINESIS_KEY_ATTRIBUTE: &str = "kinesisKey";

/// Hard cap on entries per send-message-batch call
pub const MAX_QUEUE_BATCH_ENTRIES: usize = 10;

/// Queue client error types
#[derive(Error, Debug)]
pub enum QueueClientError {
    #[error("queue request failed: {0}")]
    Request(String),

    #[error("invalid batch entry: {0}")]
    InvalidEntry(String),

    #[error("queue client construction failed: {0}")]
    Construction(String),
}

pub type Result<T> = std::result::Result<T, QueueClientError>;

/// One entry of a queue batch: a caller-unique id, the encoded body and
/// the stream partition key to preserve.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: String,
    pub body: String,
    pub key: String,
}

/// A failed entry reported by the queue, keyed by entry id.
#[derive(Debug, Clone)]
pub struct QueueFailure {
    pub id: String,
    pub code: String,
    pub message: String,
}

/// The secondary queue used while the stream is unhealthy.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Submit one sub-batch (at most [`MAX_QUEUE_BATCH_ENTRIES`] entries)
    /// in one call. Returns the failed entries; an empty list means the
    /// whole sub-batch was accepted.
    async fn send_batch(&self, entries: Vec<QueueEntry>) -> Result<Vec<QueueFailure>>;

    /// Resolve the queue URL. Success doubles as the liveness signal for
    /// the health probe.
    async fn lookup_queue(&self) -> Result<String>;
}

/// AWS SQS implementation of [`QueueClient`].
pub struct SqsQueueClient {
    client: aws_sdk_sqs::Client,
    queue_name: String,
    queue_url: String,
}

impl SqsQueueClient {
    /// Build the SDK client and resolve the queue URL. A missing queue is
    /// a construction failure: no partial sink is handed out.
    pub async fn create(config: &SinkConfig, queue_name: &str) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(ref endpoint) = config.custom_endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        let client = aws_sdk_sqs::Client::new(&sdk_config);

        let queue_url = resolve_queue_url(&client, queue_name)
            .await
            .map_err(|e| QueueClientError::Construction(e.to_string()))?;

        debug!("sqs client created for queue {} ({})", queue_name, queue_url);

        Ok(Self {
            client,
            queue_name: queue_name.to_string(),
            queue_url,
        })
    }
}

async fn resolve_queue_url(client: &aws_sdk_sqs::Client, queue_name: &str) -> Result<String> {
    let response = client
        .get_queue_url()
        .queue_name(queue_name)
        .send()
        .await
        .map_err(|e| QueueClientError::Request(e.to_string()))?;

    response
        .queue_url()
        .map(str::to_string)
        .ok_or_else(|| QueueClientError::Request(format!("no url returned for queue {}", queue_name)))
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn send_batch(&self, entries: Vec<QueueEntry>) -> Result<Vec<QueueFailure>> {
        let mut request_entries = Vec::with_capacity(entries.len());
        for entry in &entries {
            let key_attribute = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(&entry.key)
                .build()
                .map_err(|e| QueueClientError::InvalidEntry(e.to_string()))?;

            let request_entry = SendMessageBatchRequestEntry::builder()
                .id(&entry.id)
                .message_body(&entry.body)
                .message_attributes(KINESIS_KEY_ATTRIBUTE, key_attribute)
                .build()
                .map_err(|e| QueueClientError::InvalidEntry(e.to_string()))?;

            request_entries.push(request_entry);
        }

        let response = self
            .client
            .send_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(request_entries))
            .send()
            .await
            .map_err(|e| QueueClientError::Request(e.to_string()))?;

        let failures = response
            .failed()
            .iter()
            .map(|failed| QueueFailure {
                id: failed.id().to_string(),
                code: failed.code().to_string(),
                message: failed.message().unwrap_or_default().to_string(),
            })
            .collect();

        Ok(failures)
    }

    async fn lookup_queue(&self) -> Result<String> {
        resolve_queue_url(&self.client, &self.queue_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_entry_shape() {
        let entry = QueueEntry {
            id: "entry-1".to_string(),
            body: "cGF5bG9hZA==".to_string(),
            key: "partition-a".to_string(),
        };
        assert_eq!(entry.key, "partition-a");
    }

    #[test]
    fn test_batch_entry_cap_matches_wire_contract() {
        assert_eq!(MAX_QUEUE_BATCH_ENTRIES, 10);
    }
}
