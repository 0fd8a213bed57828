//! OpenTelemetry Integration
//!
//! Metrics for the sink pipeline: stored events, flushed batch sizes,
//! per-destination submission latency and failures, and scheduled
//! retries.

use opentelemetry::metrics::{Counter, Histogram, Meter, MeterProvider as _};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::Resource;
use std::sync::Arc;
use thiserror::Error;

/// Telemetry error types
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("telemetry initialization error: {0}")]
    InitializationError(String),

    #[error("metrics export error: {0}")]
    ExportError(String),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Instrument set for the sink
pub struct SinkMetrics {
    /// Events accepted from the collector
    events_stored: Counter<u64>,
    /// Records per flushed batch
    batch_size: Histogram<u64>,
    /// Destination call latency
    submit_latency: Histogram<f64>,
    /// Records rejected by a destination
    record_failures: Counter<u64>,
    /// Delayed retries scheduled
    retries_scheduled: Counter<u64>,
}

impl SinkMetrics {
    /// Create the instrument set on the given meter
    pub fn new(meter: Meter) -> Self {
        let events_stored = meter
            .u64_counter("sink_events_stored_total")
            .with_description("Total number of events accepted from the collector")
            .with_unit("events")
            .init();

        let batch_size = meter
            .u64_histogram("sink_flush_batch_size")
            .with_description("Number of records in each flushed batch")
            .with_unit("records")
            .init();

        let submit_latency = meter
            .f64_histogram("sink_submit_duration_ms")
            .with_description("Time taken by one destination call")
            .with_unit("ms")
            .init();

        let record_failures = meter
            .u64_counter("sink_record_failures_total")
            .with_description("Total number of records rejected by a destination")
            .with_unit("records")
            .init();

        let retries_scheduled = meter
            .u64_counter("sink_retries_scheduled_total")
            .with_description("Total number of delayed retries scheduled")
            .with_unit("retries")
            .init();

        Self {
            events_stored,
            batch_size,
            submit_latency,
            record_failures,
            retries_scheduled,
        }
    }

    /// Record events accepted from the collector
    pub fn record_events_stored(&self, count: u64) {
        self.events_stored.add(count, &[]);
    }

    /// Record the size of a flushed batch
    pub fn record_batch_size(&self, size: u64) {
        self.batch_size.record(size, &[]);
    }

    /// Record one destination call
    pub fn record_submit_latency(&self, destination: &'static str, duration_ms: f64, success: bool) {
        self.submit_latency.record(
            duration_ms,
            &[
                KeyValue::new("destination", destination),
                KeyValue::new("success", success.to_string()),
            ],
        );
    }

    /// Record records rejected by a destination
    pub fn record_failures(&self, destination: &'static str, count: u64) {
        self.record_failures
            .add(count, &[KeyValue::new("destination", destination)]);
    }

    /// Record a scheduled retry
    pub fn record_retry_scheduled(&self, destination: &'static str) {
        self.retries_scheduled
            .add(1, &[KeyValue::new("destination", destination)]);
    }
}

/// Telemetry provider configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name
    pub service_name: String,
    /// Service version
    pub service_version: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "event-relay-sink".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Telemetry provider
pub struct TelemetryProvider {
    meter_provider: SdkMeterProvider,
    metrics: Arc<SinkMetrics>,
}

impl TelemetryProvider {
    /// Initialize the meter provider and instrument set
    pub fn init(config: TelemetryConfig) -> Result<Self> {
        let resource = Resource::new(vec![
            KeyValue::new("service.name", config.service_name.clone()),
            KeyValue::new("service.version", config.service_version.clone()),
        ]);

        let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
        let meter = meter_provider.meter("event_relay_sink");
        let metrics = Arc::new(SinkMetrics::new(meter));

        Ok(Self {
            meter_provider,
            metrics,
        })
    }

    /// Get the instrument set
    pub fn metrics(&self) -> Arc<SinkMetrics> {
        self.metrics.clone()
    }

    /// Shut the provider down, flushing any pending export
    pub fn shutdown(&self) -> Result<()> {
        self.meter_provider
            .shutdown()
            .map_err(|e| TelemetryError::ExportError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "event-relay-sink");
        assert!(!config.service_version.is_empty());
    }

    #[test]
    fn test_provider_init_and_shutdown() {
        let provider = TelemetryProvider::init(TelemetryConfig::default()).unwrap();
        let metrics = provider.metrics();
        assert!(Arc::strong_count(&metrics) >= 1);
        provider.shutdown().unwrap();
    }

    #[test]
    fn test_record_metrics() {
        let provider = TelemetryProvider::init(TelemetryConfig::default()).unwrap();
        let metrics = provider.metrics();

        metrics.record_events_stored(3);
        metrics.record_batch_size(50);
        metrics.record_submit_latency("stream", 12.5, true);
        metrics.record_submit_latency("queue", 80.0, false);
        metrics.record_failures("stream", 2);
        metrics.record_retry_scheduled("queue");

        provider.shutdown().unwrap();
    }
}
