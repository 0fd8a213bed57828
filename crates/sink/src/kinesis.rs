//! Kinesis Stream Client
//!
//! This module defines the primary-destination seam: a narrow trait over
//! the put-records and describe-stream primitives, plus the AWS SDK
//! implementation of it. The dispatch path only ever sees the trait, so
//! tests inject their own implementations.

use async_trait::async_trait;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::PutRecordsRequestEntry;
use thiserror::Error;
use tracing::debug;

use relay_types::RawEvent;

use crate::config::SinkConfig;

/// Stream status string that indicates the stream accepts writes
pub const ACTIVE_STREAM_STATUS: &str = "ACTIVE";

/// Stream client error types
#[derive(Error, Debug)]
pub enum StreamClientError {
    #[error("stream request failed: {0}")]
    Request(String),

    #[error("stream client construction failed: {0}")]
    Construction(String),
}

pub type Result<T> = std::result::Result<T, StreamClientError>;

/// Per-record outcome of a put-records call, aligned by index with the
/// submitted batch.
#[derive(Debug, Clone, Default)]
pub struct RecordOutcome {
    /// Error code, empty or absent on success
    pub error_code: Option<String>,
    /// Human-readable error detail
    pub error_message: Option<String>,
}

impl RecordOutcome {
    /// A record failed iff its outcome carries a non-empty error code
    pub fn is_failure(&self) -> bool {
        self.error_code.as_deref().is_some_and(|code| !code.is_empty())
    }

    /// Outcome representing a whole-call failure applied to every record
    pub fn from_call_failure(message: impl Into<String>) -> Self {
        Self {
            error_code: Some("RequestFailure".to_string()),
            error_message: Some(message.into()),
        }
    }
}

/// The primary record stream, partitioned by event key.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Submit a batch in one call. Returns one outcome per submitted
    /// event, in submission order.
    async fn put_records(&self, events: &[RawEvent]) -> Result<Vec<RecordOutcome>>;

    /// Current stream status string (see [`ACTIVE_STREAM_STATUS`]).
    async fn stream_status(&self) -> Result<String>;
}

/// AWS Kinesis implementation of [`StreamClient`].
pub struct KinesisStreamClient {
    client: aws_sdk_kinesis::Client,
    stream_name: String,
}

impl KinesisStreamClient {
    /// Build the SDK client from the sink configuration.
    pub async fn create(config: &SinkConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(ref endpoint) = config.custom_endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        let client = aws_sdk_kinesis::Client::new(&sdk_config);

        debug!("kinesis client created for stream {}", config.stream_name);

        Ok(Self {
            client,
            stream_name: config.stream_name.clone(),
        })
    }
}

#[async_trait]
impl StreamClient for KinesisStreamClient {
    async fn put_records(&self, events: &[RawEvent]) -> Result<Vec<RecordOutcome>> {
        let mut entries = Vec::with_capacity(events.len());
        for event in events {
            let entry = PutRecordsRequestEntry::builder()
                .partition_key(event.key.clone())
                .data(Blob::new(event.payload.clone()))
                .build()
                .map_err(|e| StreamClientError::Request(e.to_string()))?;
            entries.push(entry);
        }

        let response = self
            .client
            .put_records()
            .stream_name(&self.stream_name)
            .set_records(Some(entries))
            .send()
            .await
            .map_err(|e| StreamClientError::Request(e.to_string()))?;

        let outcomes = response
            .records()
            .iter()
            .map(|record| RecordOutcome {
                error_code: record.error_code().map(str::to_string),
                error_message: record.error_message().map(str::to_string),
            })
            .collect();

        Ok(outcomes)
    }

    async fn stream_status(&self) -> Result<String> {
        let response = self
            .client
            .describe_stream()
            .stream_name(&self.stream_name)
            .send()
            .await
            .map_err(|e| StreamClientError::Request(e.to_string()))?;

        let status = response
            .stream_description()
            .map(|description| description.stream_status().as_str().to_string())
            .unwrap_or_default();

        Ok(status)
    }
}
