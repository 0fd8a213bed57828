//! Event Sink
//!
//! The facade the collector front-end talks to: a factory that wires the
//! buffer, dispatch worker and flush schedule together, a non-blocking
//! store call, the readiness view, statistics, and a timeout-bounded
//! shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use relay_types::{EventBatch, RawEvent};

use crate::buffer::{spawn_flush_schedule, EventBuffer};
use crate::config::{ConfigError, SinkConfig};
use crate::dispatcher::{bump, Dispatcher, Inflight, SecondaryQueue};
use crate::health::{ComponentHealth, HealthReport, HealthStatus};
use crate::kinesis::{KinesisStreamClient, StreamClient, StreamClientError};
use crate::sqs::{QueueClient, QueueClientError, SqsQueueClient};
use crate::telemetry::{SinkMetrics, TelemetryConfig, TelemetryError, TelemetryProvider};

/// How long shutdown waits for in-flight submissions before discarding
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Sink error types
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Invalid or unloadable configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Stream client construction or request failure
    #[error(transparent)]
    Stream(#[from] StreamClientError),

    /// Queue client construction or request failure
    #[error(transparent)]
    Queue(#[from] QueueClientError),

    /// Telemetry initialization failure
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    /// The sink no longer accepts events
    #[error("sink is shut down")]
    ShutDown,
}

/// Sink statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct SinkStats {
    /// Events accepted from the collector
    pub events_stored: u64,
    /// Batches handed to the dispatch path
    pub batches_flushed: u64,
    /// Records accepted by the stream
    pub records_sent_stream: u64,
    /// Records accepted by the queue
    pub records_sent_queue: u64,
    /// Record rejections observed on the stream
    pub records_failed_stream: u64,
    /// Record rejections observed on the queue
    pub records_failed_queue: u64,
    /// Delayed retries scheduled
    pub retries_scheduled: u64,
    /// Records discarded because shutdown cut their retry short
    pub records_dropped: u64,
}

impl SinkStats {
    fn from_map(map: &DashMap<String, u64>) -> Self {
        let get = |key: &str| map.get(key).map(|v| *v).unwrap_or(0);
        Self {
            events_stored: get("events_stored"),
            batches_flushed: get("batches_flushed"),
            records_sent_stream: get("records_sent_stream"),
            records_sent_queue: get("records_sent_queue"),
            records_failed_stream: get("records_failed_stream"),
            records_failed_queue: get("records_failed_queue"),
            retries_scheduled: get("retries_scheduled"),
            records_dropped: get("records_dropped"),
        }
    }
}

/// Dual-destination streaming sink with failover and surge protection.
///
/// Events staged through [`EventSink::store_raw_events`] are coalesced by
/// count, bytes or age and forwarded to the primary stream, spilling over
/// to the fallback queue while the stream is unhealthy.
pub struct EventSink {
    buffer: Arc<EventBuffer>,
    dispatcher: Arc<Dispatcher>,
    inflight: Arc<Inflight>,
    stats: Arc<DashMap<String, u64>>,
    metrics: Option<Arc<SinkMetrics>>,
    telemetry: Option<TelemetryProvider>,
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventSink {
    /// Build a sink from configuration, constructing the AWS clients.
    pub async fn create(config: SinkConfig) -> Result<Self, SinkError> {
        EventSinkBuilder::new(config).build().await
    }

    /// Stage a group of events under one partition key.
    ///
    /// Never blocks on network I/O; the events are buffered in memory and
    /// submitted by background tasks. Payloads are expected to respect
    /// the configured `max_bytes` cap; the collector enforces that before
    /// calling.
    pub fn store_raw_events(&self, payloads: Vec<Vec<u8>>, key: &str) -> Result<(), SinkError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SinkError::ShutDown);
        }
        let count = payloads.len() as u64;
        for payload in payloads {
            self.buffer.store(RawEvent::new(payload, key));
        }
        bump(&self.stats, "events_stored", count);
        if let Some(m) = &self.metrics {
            m.record_events_stored(count);
        }
        Ok(())
    }

    /// Readiness signal: true while at least one destination accepts
    /// traffic.
    pub fn is_healthy(&self) -> bool {
        self.dispatcher.stream_is_healthy() || self.dispatcher.queue_is_healthy().unwrap_or(false)
    }

    /// Per-destination view of the same flags behind [`EventSink::is_healthy`].
    pub fn health_report(&self) -> HealthReport {
        let stream_healthy = self.dispatcher.stream_is_healthy();
        let queue_healthy = self.dispatcher.queue_is_healthy();

        let mut components = vec![if stream_healthy {
            ComponentHealth::healthy("stream", "accepting writes")
        } else {
            ComponentHealth::unhealthy("stream", "probe in progress")
        }];
        if let Some(queue_healthy) = queue_healthy {
            components.push(if queue_healthy {
                ComponentHealth::healthy("queue", "accepting spill-over")
            } else {
                ComponentHealth::unhealthy("queue", "probe in progress")
            });
        }

        let overall = match (stream_healthy, queue_healthy) {
            (true, _) => HealthStatus::Healthy,
            (false, Some(true)) => HealthStatus::Degraded,
            (false, _) => HealthStatus::Unhealthy,
        };

        HealthReport::new(overall, components)
    }

    /// Current statistics
    pub fn stats(&self) -> SinkStats {
        SinkStats::from_map(&self.stats)
    }

    /// Drain and stop. Performs a final flush, then waits up to ten
    /// seconds for in-flight submissions; whatever is still pending after
    /// that is discarded. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("sink shutdown already performed");
            return;
        }

        info!("shutting down event sink");
        self.buffer.flush();
        let _ = self.shutdown_tx.send(true);

        if timeout(SHUTDOWN_TIMEOUT, self.inflight.wait_idle()).await.is_err() {
            error!(
                "sink shutdown timed out after {:?}, discarding {} in-flight submissions",
                SHUTDOWN_TIMEOUT,
                self.inflight.active()
            );
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("sink task ended abnormally: {}", e);
            }
        }

        if let Some(telemetry) = &self.telemetry {
            if let Err(e) = telemetry.shutdown() {
                warn!("telemetry shutdown failed: {}", e);
            }
        }

        info!("event sink shutdown complete");
    }
}

/// Builder for [`EventSink`]. Destination clients default to the AWS
/// implementations and can be swapped for any [`StreamClient`] /
/// [`QueueClient`], which is how tests inject scripted destinations.
pub struct EventSinkBuilder {
    config: SinkConfig,
    enable_telemetry: bool,
    stream_client: Option<Arc<dyn StreamClient>>,
    queue_client: Option<Arc<dyn QueueClient>>,
}

impl EventSinkBuilder {
    /// Create a builder over the given configuration
    pub fn new(config: SinkConfig) -> Self {
        Self {
            config,
            enable_telemetry: false,
            stream_client: None,
            queue_client: None,
        }
    }

    /// Enable OpenTelemetry metrics
    pub fn with_telemetry(mut self, enable: bool) -> Self {
        self.enable_telemetry = enable;
        self
    }

    /// Use the given stream client instead of building one
    pub fn with_stream_client(mut self, client: Arc<dyn StreamClient>) -> Self {
        self.stream_client = Some(client);
        self
    }

    /// Use the given queue client instead of building one. Only takes
    /// effect when `sqs_buffer_name` is configured.
    pub fn with_queue_client(mut self, client: Arc<dyn QueueClient>) -> Self {
        self.queue_client = Some(client);
        self
    }

    /// Validate the configuration, construct the destination clients and
    /// start the background tasks. On error no sink is handed out.
    pub async fn build(self) -> Result<EventSink, SinkError> {
        self.config.validate()?;

        let telemetry = if self.enable_telemetry {
            Some(TelemetryProvider::init(TelemetryConfig::default())?)
        } else {
            None
        };
        let metrics = telemetry.as_ref().map(TelemetryProvider::metrics);

        let stream: Arc<dyn StreamClient> = match self.stream_client {
            Some(client) => client,
            None => Arc::new(KinesisStreamClient::create(&self.config).await?),
        };

        let queue = match &self.config.sqs_buffer_name {
            Some(name) => {
                let client: Arc<dyn QueueClient> = match self.queue_client {
                    Some(client) => client,
                    None => Arc::new(SqsQueueClient::create(&self.config, name).await?),
                };
                Some(SecondaryQueue {
                    client,
                    max_bytes: self.config.sqs_max_bytes,
                })
            }
            None => None,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let inflight = Arc::new(Inflight::new());
        let stats: Arc<DashMap<String, u64>> = Arc::new(DashMap::new());

        let dispatcher = Arc::new(Dispatcher::new(
            stream,
            queue,
            self.config.backoff.clone(),
            self.config.startup_check_interval(),
            inflight.clone(),
            shutdown_rx.clone(),
            stats.clone(),
            metrics.clone(),
        ));

        let buffer = Arc::new(EventBuffer::new(
            self.config.buffer.clone(),
            outbox_tx,
            inflight.clone(),
        ));

        let worker = spawn_dispatch_worker(
            dispatcher.clone(),
            outbox_rx,
            stats.clone(),
            shutdown_rx.clone(),
        );
        let flusher = spawn_flush_schedule(buffer.clone(), shutdown_rx);

        info!(
            "event sink started for stream {} (queue spill-over: {})",
            self.config.stream_name,
            self.config.has_queue()
        );

        Ok(EventSink {
            buffer,
            dispatcher,
            inflight,
            stats,
            metrics,
            telemetry,
            shutdown_tx,
            shut_down: AtomicBool::new(false),
            tasks: Mutex::new(vec![worker, flusher]),
        })
    }
}

fn spawn_dispatch_worker(
    dispatcher: Arc<Dispatcher>,
    mut outbox: mpsc::UnboundedReceiver<EventBatch>,
    stats: Arc<DashMap<String, u64>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                maybe_batch = outbox.recv() => match maybe_batch {
                    Some(batch) => launch(&dispatcher, &stats, batch),
                    None => break,
                },
                _ = shutdown.changed() => {
                    // The final flush may already sit in the channel
                    while let Ok(batch) = outbox.try_recv() {
                        launch(&dispatcher, &stats, batch);
                    }
                    break;
                }
            }
        }
        debug!("dispatch worker stopped");
    })
}

fn launch(dispatcher: &Arc<Dispatcher>, stats: &Arc<DashMap<String, u64>>, batch: EventBatch) {
    bump(stats, "batches_flushed", 1);
    tokio::spawn(dispatcher.clone().run(batch));
}
