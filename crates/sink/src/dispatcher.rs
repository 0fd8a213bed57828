//! Dispatch & Failover
//!
//! Routes each flushed batch to the stream or the fallback queue based on
//! observed destination health, feeds failed records back through delayed
//! retries, and hands exhausted chains over to the other destination.
//!
//! Records larger than the queue's per-message cap can never fail over:
//! they are held for the stream with an unbounded retry chain rather than
//! dropped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use relay_types::{EventBatch, RawEvent};

use crate::health::{self, DestinationHealth};
use crate::kinesis::{RecordOutcome, StreamClient};
use crate::retry::{BackoffPolicy, RetryPlan};
use crate::splitter::split_batch;
use crate::sqs::{QueueClient, QueueEntry, MAX_QUEUE_BATCH_ENTRIES};
use crate::telemetry::SinkMetrics;

/// Count of submissions and retries currently running or scheduled.
/// Shutdown waits on this before discarding anything.
pub(crate) struct Inflight {
    count: AtomicUsize,
    idle: Notify,
}

impl Inflight {
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn incr(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn active(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolve once no submissions remain in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Destination {
    Stream,
    Queue,
}

impl Destination {
    fn label(&self) -> &'static str {
        match self {
            Destination::Stream => "stream",
            Destination::Queue => "queue",
        }
    }
}

/// The fallback queue and its per-message byte cap.
pub(crate) struct SecondaryQueue {
    pub client: Arc<dyn QueueClient>,
    pub max_bytes: usize,
}

/// Failover controller shared by the dispatch worker and every retry task.
pub(crate) struct Dispatcher {
    stream: Arc<dyn StreamClient>,
    queue: Option<SecondaryQueue>,
    stream_health: Arc<DestinationHealth>,
    queue_health: Arc<DestinationHealth>,
    backoff: BackoffPolicy,
    startup_check_interval: Duration,
    inflight: Arc<Inflight>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<DashMap<String, u64>>,
    metrics: Option<Arc<SinkMetrics>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: Arc<dyn StreamClient>,
        queue: Option<SecondaryQueue>,
        backoff: BackoffPolicy,
        startup_check_interval: Duration,
        inflight: Arc<Inflight>,
        shutdown: watch::Receiver<bool>,
        stats: Arc<DashMap<String, u64>>,
        metrics: Option<Arc<SinkMetrics>>,
    ) -> Self {
        Self {
            stream,
            queue,
            stream_health: Arc::new(DestinationHealth::new("stream")),
            queue_health: Arc::new(DestinationHealth::new("queue")),
            backoff,
            startup_check_interval,
            inflight,
            shutdown,
            stats,
            metrics,
        }
    }

    pub fn stream_is_healthy(&self) -> bool {
        self.stream_health.is_healthy()
    }

    /// `None` when no fallback queue is configured.
    pub fn queue_is_healthy(&self) -> Option<bool> {
        self.queue.as_ref().map(|_| self.queue_health.is_healthy())
    }

    /// Dispatch one batch and release the in-flight slot the buffer took
    /// when it handed the batch over.
    pub async fn run(self: Arc<Self>, batch: EventBatch) {
        let inflight = self.inflight.clone();
        self.dispatch(batch).await;
        inflight.decr();
    }

    /// Route one flushed batch.
    ///
    /// While the stream is healthy (or is the only destination) the whole
    /// batch goes there. Otherwise events that fit the queue's message
    /// cap spill over to the queue, and oversized ones wait on the stream
    /// indefinitely.
    pub async fn dispatch(self: Arc<Self>, batch: EventBatch) {
        debug!(
            "dispatching batch {} ({} records, {} bytes)",
            batch.batch_id,
            batch.len(),
            batch.byte_size()
        );
        if let Some(m) = &self.metrics {
            m.record_batch_size(batch.len() as u64);
        }

        let plan = RetryPlan::initial(&self.backoff);
        if self.stream_health.is_healthy() || self.queue.is_none() {
            self.submit_to_stream(batch.events, plan).await;
            return;
        }

        let cap = self.queue.as_ref().map(|q| q.max_bytes).unwrap_or(usize::MAX);
        let (fitting, oversized): (Vec<_>, Vec<_>) =
            batch.events.into_iter().partition(|e| e.size() <= cap);

        if !oversized.is_empty() {
            warn!(
                "{} records exceed the queue message cap, holding them for the stream",
                oversized.len()
            );
            self.schedule_retry(Destination::Stream, oversized, RetryPlan::unbounded(&self.backoff));
        }
        if !fitting.is_empty() {
            self.submit_to_queue(fitting, plan).await;
        }
    }

    async fn submit_to_stream(self: &Arc<Self>, events: Vec<RawEvent>, plan: RetryPlan) {
        let total = events.len();
        let start = Instant::now();

        let outcomes = match self.stream.put_records(&events).await {
            Ok(outcomes) => {
                // Any successful call marks the destination healthy, even
                // when individual records were rejected.
                self.stream_health.mark_healthy();
                self.observe_submit(Destination::Stream, start, true);
                outcomes
            }
            Err(e) => {
                self.observe_submit(Destination::Stream, start, false);
                warn!("stream call failed for all {} records: {}", total, e);
                vec![RecordOutcome::from_call_failure(e.to_string()); total]
            }
        };

        let mut failed = Vec::new();
        let mut sample = None;
        for (event, outcome) in events.into_iter().zip(outcomes) {
            if outcome.is_failure() {
                if sample.is_none() {
                    sample = Some(outcome);
                }
                failed.push(event);
            }
        }

        bump(&self.stats, "records_sent_stream", (total - failed.len()) as u64);
        if failed.is_empty() {
            debug!("wrote {} records to stream", total);
            return;
        }

        bump(&self.stats, "records_failed_stream", failed.len() as u64);
        if let Some(m) = &self.metrics {
            m.record_failures(Destination::Stream.label(), failed.len() as u64);
        }
        if let Some(sample) = sample {
            warn!(
                "{}/{} records failed on stream ({}: {})",
                failed.len(),
                total,
                sample.error_code.unwrap_or_default(),
                sample.error_message.unwrap_or_default()
            );
        }

        self.handle_stream_failures(failed, plan).await;
    }

    async fn handle_stream_failures(self: &Arc<Self>, failed: Vec<RawEvent>, plan: RetryPlan) {
        if let Some(next) = plan.next(&self.backoff) {
            self.schedule_retry(Destination::Stream, failed, next);
            return;
        }

        // Retries exhausted on the stream
        match &self.queue {
            Some(queue) => {
                self.mark_stream_unhealthy().await;
                let cap = queue.max_bytes;
                let (fitting, oversized): (Vec<_>, Vec<_>) =
                    failed.into_iter().partition(|e| e.size() <= cap);
                if !fitting.is_empty() {
                    let plan = RetryPlan::fresh(&self.backoff, self.backoff.min_backoff());
                    self.schedule_retry(Destination::Queue, fitting, plan);
                }
                if !oversized.is_empty() {
                    warn!(
                        "{} failed records exceed the queue message cap, holding them for the stream",
                        oversized.len()
                    );
                    self.schedule_retry(Destination::Stream, oversized, RetryPlan::unbounded(&self.backoff));
                }
            }
            None => {
                // Only one path available: keep hammering the stream
                self.mark_stream_unhealthy().await;
                let plan = RetryPlan::fresh(&self.backoff, self.backoff.max_backoff());
                self.schedule_retry(Destination::Stream, failed, plan);
            }
        }
    }

    async fn submit_to_queue(self: &Arc<Self>, events: Vec<RawEvent>, plan: RetryPlan) {
        let queue = match &self.queue {
            Some(queue) => queue,
            None => return self.submit_to_stream(events, plan).await,
        };

        let sub_batches = split_batch(events, RawEvent::size, MAX_QUEUE_BATCH_ENTRIES, queue.max_bytes);
        let mut failed = Vec::new();

        for sub in sub_batches {
            let start = Instant::now();
            let tagged: Vec<(String, RawEvent)> = sub
                .into_iter()
                .map(|event| (Uuid::new_v4().to_string(), event))
                .collect();
            let entries: Vec<QueueEntry> = tagged
                .iter()
                .map(|(id, event)| QueueEntry {
                    id: id.clone(),
                    body: general_purpose::STANDARD.encode(&event.payload),
                    key: event.key.clone(),
                })
                .collect();

            match queue.client.send_batch(entries).await {
                Ok(failures) => {
                    self.queue_health.mark_healthy();
                    self.observe_submit(Destination::Queue, start, true);
                    if let Some(first) = failures.first() {
                        warn!(
                            "{} queue entries failed ({}: {})",
                            failures.len(),
                            first.code,
                            first.message
                        );
                    }
                    let failed_ids: HashSet<&str> =
                        failures.iter().map(|f| f.id.as_str()).collect();
                    let mut sent = 0u64;
                    for (id, event) in tagged {
                        if failed_ids.contains(id.as_str()) {
                            failed.push(event);
                        } else {
                            sent += 1;
                        }
                    }
                    bump(&self.stats, "records_sent_queue", sent);
                }
                Err(e) => {
                    self.observe_submit(Destination::Queue, start, false);
                    warn!("queue call failed for all {} records: {}", tagged.len(), e);
                    failed.extend(tagged.into_iter().map(|(_, event)| event));
                }
            }
        }

        if failed.is_empty() {
            return;
        }
        bump(&self.stats, "records_failed_queue", failed.len() as u64);
        if let Some(m) = &self.metrics {
            m.record_failures(Destination::Queue.label(), failed.len() as u64);
        }
        self.handle_queue_failures(failed, plan).await;
    }

    async fn handle_queue_failures(self: &Arc<Self>, failed: Vec<RawEvent>, plan: RetryPlan) {
        if let Some(next) = plan.next(&self.backoff) {
            self.schedule_retry(Destination::Queue, failed, next);
            return;
        }

        // Queue chain exhausted: bounce the records back to the stream
        self.mark_queue_unhealthy().await;
        let plan = RetryPlan::fresh(&self.backoff, self.backoff.min_backoff());
        self.schedule_retry(Destination::Stream, failed, plan);
    }

    fn schedule_retry(self: &Arc<Self>, destination: Destination, events: Vec<RawEvent>, plan: RetryPlan) {
        if events.is_empty() {
            return;
        }
        bump(&self.stats, "retries_scheduled", 1);
        if let Some(m) = &self.metrics {
            m.record_retry_scheduled(destination.label());
        }
        debug!(
            "retrying {} records on the {} in {:?} ({} left)",
            events.len(),
            destination.label(),
            plan.delay,
            plan.retries_left
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unbounded".to_string())
        );

        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        self.inflight.incr();
        tokio::spawn(async move {
            if !*shutdown.borrow() {
                tokio::select! {
                    _ = sleep(plan.delay) => match destination {
                        Destination::Stream => this.submit_to_stream(events, plan).await,
                        Destination::Queue => this.submit_to_queue(events, plan).await,
                    },
                    _ = shutdown.changed() => {
                        bump(&this.stats, "records_dropped", events.len() as u64);
                        debug!("discarding {} scheduled records during shutdown", events.len());
                    }
                }
            } else {
                bump(&this.stats, "records_dropped", events.len() as u64);
                debug!("discarding {} scheduled records during shutdown", events.len());
            }
            this.inflight.decr();
        });
    }

    async fn mark_stream_unhealthy(self: &Arc<Self>) {
        let client = self.stream.clone();
        let health = self.stream_health.clone();
        let interval = self.startup_check_interval;
        let shutdown = self.shutdown.clone();
        self.stream_health
            .flip_unhealthy(move || health::spawn_stream_probe(client, health, interval, shutdown))
            .await;
    }

    async fn mark_queue_unhealthy(self: &Arc<Self>) {
        let queue = match &self.queue {
            Some(queue) => queue,
            None => return,
        };
        let client = queue.client.clone();
        let health = self.queue_health.clone();
        let interval = self.startup_check_interval;
        let shutdown = self.shutdown.clone();
        self.queue_health
            .flip_unhealthy(move || health::spawn_queue_probe(client, health, interval, shutdown))
            .await;
    }

    fn observe_submit(&self, destination: Destination, start: Instant, success: bool) {
        if let Some(m) = &self.metrics {
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            m.record_submit_latency(destination.label(), elapsed_ms, success);
        }
    }
}

pub(crate) fn bump(stats: &DashMap<String, u64>, key: &str, by: u64) {
    if by == 0 {
        return;
    }
    stats
        .entry(key.to_string())
        .and_modify(|v| *v += by)
        .or_insert(by);
}
