//! Destination Health
//!
//! Per-destination liveness flags, the background probe loops that clear
//! them, and a serializable health report for the host's readiness
//! endpoint.
//!
//! A destination flips to unhealthy only through [`DestinationHealth::flip_unhealthy`],
//! which pairs the flip with the probe launch under one lock so rapid
//! failover flicker cannot start duplicate probes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::kinesis::{StreamClient, ACTIVE_STREAM_STATUS};
use crate::sqs::QueueClient;

/// Health status of a component
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Component accepts traffic
    Healthy,
    /// Traffic flows, but over a fallback path
    Degraded,
    /// Component cannot accept traffic
    Unhealthy,
}

impl HealthStatus {
    /// Check if the status is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Check if the status is unhealthy
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// Health of one destination as last observed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Destination name
    pub component_name: String,
    /// Health status
    pub status: HealthStatus,
    /// Status message providing details
    pub message: String,
    /// When this report was assembled
    pub last_check: DateTime<Utc>,
}

impl ComponentHealth {
    /// Create a healthy component entry
    pub fn healthy(component_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component_name: component_name.into(),
            status: HealthStatus::Healthy,
            message: message.into(),
            last_check: Utc::now(),
        }
    }

    /// Create an unhealthy component entry
    pub fn unhealthy(component_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component_name: component_name.into(),
            status: HealthStatus::Unhealthy,
            message: message.into(),
            last_check: Utc::now(),
        }
    }
}

/// Readiness view over both destinations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status: healthy while the stream accepts traffic, degraded
    /// while only the fallback queue does, unhealthy otherwise
    pub overall_status: HealthStatus,
    /// Individual destination health
    pub components: Vec<ComponentHealth>,
    /// Timestamp of this report
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub(crate) fn new(overall_status: HealthStatus, components: Vec<ComponentHealth>) -> Self {
        Self {
            overall_status,
            components,
            timestamp: Utc::now(),
        }
    }

    /// Check if the sink is ready to accept traffic
    pub fn is_ready(&self) -> bool {
        !self.overall_status.is_unhealthy()
    }
}

/// Mutable health flag of a single destination.
///
/// Reads are lock-free; the unhealthy flip is double-checked under
/// `flip_lock` together with the probe launch.
pub(crate) struct DestinationHealth {
    name: &'static str,
    healthy: AtomicBool,
    flip_lock: Mutex<()>,
}

impl DestinationHealth {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            healthy: AtomicBool::new(true),
            flip_lock: Mutex::new(()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Record a successful call against this destination.
    pub fn mark_healthy(&self) {
        if !self.healthy.swap(true, Ordering::AcqRel) {
            info!("{} destination is healthy again", self.name);
        }
    }

    /// Flip to unhealthy and launch the probe, once, no matter how many
    /// exhausted retry chains report the outage concurrently. Returns
    /// whether this caller performed the flip.
    pub async fn flip_unhealthy<F: FnOnce()>(&self, launch_probe: F) -> bool {
        if !self.healthy.load(Ordering::Acquire) {
            return false;
        }
        let _guard = self.flip_lock.lock().await;
        if !self.healthy.load(Ordering::Acquire) {
            return false;
        }
        self.healthy.store(false, Ordering::Release);
        warn!("{} destination marked unhealthy, probing until it recovers", self.name);
        launch_probe();
        true
    }
}

/// Probe the stream until it reports an active status, then clear the
/// health flag and exit.
pub(crate) fn spawn_stream_probe(
    client: Arc<dyn StreamClient>,
    health: Arc<DestinationHealth>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        debug!("stream probe started");
        while !health.is_healthy() {
            match client.stream_status().await {
                Ok(status) if status == ACTIVE_STREAM_STATUS => {
                    health.mark_healthy();
                    return;
                }
                Ok(status) => debug!("stream not ready yet (status {})", status),
                Err(e) => warn!("stream probe attempt failed: {}", e),
            }
            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.changed() => {
                    debug!("stream probe stopped for shutdown");
                    return;
                }
            }
        }
    });
}

/// Probe the queue until the queue-url lookup succeeds, then clear the
/// health flag and exit.
pub(crate) fn spawn_queue_probe(
    client: Arc<dyn QueueClient>,
    health: Arc<DestinationHealth>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        debug!("queue probe started");
        while !health.is_healthy() {
            match client.lookup_queue().await {
                Ok(url) => {
                    debug!("queue lookup succeeded ({})", url);
                    health.mark_healthy();
                    return;
                }
                Err(e) => warn!("queue probe attempt failed: {}", e),
            }
            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.changed() => {
                    debug!("queue probe stopped for shutdown");
                    return;
                }
            }
        }
    });
}
