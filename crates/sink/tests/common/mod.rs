//! Common test utilities for integration tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use relay_sink::{
    BackoffPolicy, BufferConfig, QueueClient, QueueClientError, QueueEntry, QueueFailure,
    RawEvent, RecordOutcome, SinkConfig, StreamClient, StreamClientError,
};

/// Scripted outcome of one put-records call
pub enum PutScript {
    /// Every record accepted
    Ok,
    /// Records at these indices rejected with an error code
    FailIndices(Vec<usize>),
    /// The whole call fails
    Err(String),
}

/// Stream double that replays a script and records every call
#[derive(Default)]
pub struct MockStream {
    script: Mutex<VecDeque<PutScript>>,
    pub calls: Mutex<Vec<Vec<RawEvent>>>,
    statuses: Mutex<VecDeque<String>>,
    pub status_calls: AtomicUsize,
}

impl MockStream {
    pub fn push_script(&self, script: PutScript) {
        self.script.lock().unwrap().push_back(script);
    }

    pub fn push_statuses(&self, statuses: &[&str]) {
        let mut queue = self.statuses.lock().unwrap();
        for status in statuses {
            queue.push_back(status.to_string());
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn records_seen(&self) -> usize {
        self.calls.lock().unwrap().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl StreamClient for MockStream {
    async fn put_records(
        &self,
        events: &[RawEvent],
    ) -> Result<Vec<RecordOutcome>, StreamClientError> {
        self.calls.lock().unwrap().push(events.to_vec());
        let script = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PutScript::Ok);
        match script {
            PutScript::Ok => Ok(vec![RecordOutcome::default(); events.len()]),
            PutScript::FailIndices(indices) => Ok((0..events.len())
                .map(|i| {
                    if indices.contains(&i) {
                        RecordOutcome {
                            error_code: Some("ProvisionedThroughputExceededException".to_string()),
                            error_message: Some("simulated throttle".to_string()),
                        }
                    } else {
                        RecordOutcome::default()
                    }
                })
                .collect()),
            PutScript::Err(message) => Err(StreamClientError::Request(message)),
        }
    }

    async fn stream_status(&self) -> Result<String, StreamClientError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let status = self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "ACTIVE".to_string());
        Ok(status)
    }
}

/// Scripted outcome of one send-message-batch call
pub enum SendScript {
    /// Every entry accepted
    Ok,
    /// Every entry in the call rejected
    FailAll,
    /// The whole call fails
    Err(String),
}

/// Queue double that replays a script and records every call
#[derive(Default)]
pub struct MockQueue {
    script: Mutex<VecDeque<SendScript>>,
    pub calls: Mutex<Vec<Vec<QueueEntry>>>,
    pub lookup_calls: AtomicUsize,
}

impl MockQueue {
    pub fn push_script(&self, script: SendScript) {
        self.script.lock().unwrap().push_back(script);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn entries_seen(&self) -> usize {
        self.calls.lock().unwrap().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl QueueClient for MockQueue {
    async fn send_batch(
        &self,
        entries: Vec<QueueEntry>,
    ) -> Result<Vec<QueueFailure>, QueueClientError> {
        let script = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendScript::Ok);
        let result = match script {
            SendScript::Ok => Ok(Vec::new()),
            SendScript::FailAll => Ok(entries
                .iter()
                .map(|entry| QueueFailure {
                    id: entry.id.clone(),
                    code: "ServiceUnavailable".to_string(),
                    message: "simulated rejection".to_string(),
                })
                .collect()),
            SendScript::Err(message) => Err(QueueClientError::Request(message)),
        };
        self.calls.lock().unwrap().push(entries);
        result
    }

    async fn lookup_queue(&self) -> Result<String, QueueClientError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        Ok("https://example.com/000000000000/test-buffer".to_string())
    }
}

/// Sink config with small thresholds and fast backoff for tests
pub fn test_config() -> SinkConfig {
    SinkConfig {
        stream_name: "test-stream".to_string(),
        region: "us-east-1".to_string(),
        custom_endpoint: None,
        max_bytes: 100_000,
        buffer: BufferConfig {
            record_limit: 100,
            byte_limit: 100_000,
            time_limit_ms: 50,
        },
        backoff: BackoffPolicy {
            min_backoff_ms: 5,
            max_backoff_ms: 15,
            max_retries: 2,
        },
        startup_check_interval_ms: 10,
        sqs_max_bytes: 1_000,
        sqs_buffer_name: None,
    }
}

/// Wait for a condition with timeout
pub async fn wait_for_condition<F>(mut check: F, timeout: Duration, check_interval: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(check_interval).await;
    }
    false
}

/// Wait for a condition with the default test timeout, panicking on expiry
pub async fn assert_eventually<F>(check: F, what: &str)
where
    F: FnMut() -> bool,
{
    assert!(
        wait_for_condition(check, Duration::from_secs(5), Duration::from_millis(5)).await,
        "timed out waiting for: {}",
        what
    );
}
