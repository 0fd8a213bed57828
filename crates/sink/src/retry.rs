//! Retry Scheduling
//!
//! Backoff policy for delayed re-submission of failed records. The next
//! delay is a uniform sample of the configured band, floored by two
//! thirds of the current delay so a chain already near the ceiling decays
//! smoothly instead of snapping back to the minimum.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff policy for retrying failed submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Lower bound of the randomized delay band, in milliseconds
    pub min_backoff_ms: u64,
    /// Upper bound of the randomized delay band, in milliseconds
    pub max_backoff_ms: u64,
    /// Retry attempts per destination before the failover policy kicks in
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_backoff_ms: 3_000,
            max_backoff_ms: 600_000,
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// Minimum backoff as a duration
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    /// Maximum backoff as a duration
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), String> {
        if self.min_backoff_ms == 0 {
            return Err("min_backoff_ms must be greater than 0".to_string());
        }
        if self.min_backoff_ms > self.max_backoff_ms {
            return Err("min_backoff_ms cannot exceed max_backoff_ms".to_string());
        }
        Ok(())
    }
}

/// Compute the delay for the next retry attempt given the current one.
///
/// `max(min + uniform[0, max - min], current * 2/3)` in milliseconds.
pub fn next_backoff(policy: &BackoffPolicy, current: Duration) -> Duration {
    let span = policy.max_backoff_ms - policy.min_backoff_ms;
    let sampled = policy.min_backoff_ms + jitter(span);
    let decayed = current.as_millis() as u64 / 3 * 2;
    Duration::from_millis(sampled.max(decayed))
}

fn jitter(span_ms: u64) -> u64 {
    if span_ms == 0 {
        return 0;
    }
    rand::random::<u64>() % (span_ms + 1)
}

/// How one attempt chain is carried through the dispatch path: how many
/// retries remain (`None` means unbounded) and the delay the current
/// attempt was scheduled with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPlan {
    pub retries_left: Option<u32>,
    pub delay: Duration,
}

impl RetryPlan {
    /// Plan for a freshly flushed batch.
    pub fn initial(policy: &BackoffPolicy) -> Self {
        Self {
            retries_left: Some(policy.max_retries),
            delay: policy.min_backoff(),
        }
    }

    /// Plan for records that may only ever land on the stream.
    pub fn unbounded(policy: &BackoffPolicy) -> Self {
        Self {
            retries_left: None,
            delay: policy.max_backoff(),
        }
    }

    /// Plan for a fresh chain on the other destination after exhaustion.
    pub fn fresh(policy: &BackoffPolicy, delay: Duration) -> Self {
        Self {
            retries_left: Some(policy.max_retries),
            delay,
        }
    }

    /// The follow-up plan after this attempt failed, or `None` when the
    /// chain is exhausted.
    pub fn next(&self, policy: &BackoffPolicy) -> Option<Self> {
        let retries_left = match self.retries_left {
            None => None,
            Some(0) => return None,
            Some(n) => Some(n - 1),
        };
        Some(Self {
            retries_left,
            delay: next_backoff(policy, self.delay),
        })
    }
}
