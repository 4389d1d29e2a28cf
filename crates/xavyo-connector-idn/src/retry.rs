//! Retry policy for IdentityNow API requests.
//!
//! Bounded exponential backoff with jitter. A `Retry-After` hint from the
//! upstream overrides the computed delay and is honored exactly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_retries() -> u32 {
    10
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_jitter_factor() -> f64 {
    0.25
}

fn default_retry_status_codes() -> Vec<u16> {
    vec![429, 502, 503, 504]
}

/// Retry configuration for outbound calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt (default: 10).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds (default: 1000ms).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Cap on the computed delay in milliseconds (default: 60000ms).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Jitter as a fraction of the computed delay (default: 0.25).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Statuses that trigger a retry. 429 is always retried.
    #[serde(default = "default_retry_status_codes")]
    pub retry_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_factor: default_jitter_factor(),
            retry_status_codes: default_retry_status_codes(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom max retries.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Creates a policy optimized for testing (millisecond delays).
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            jitter_factor: 0.0,
            retry_status_codes: default_retry_status_codes(),
        }
    }

    /// Adds statuses to the retry set (e.g. 400 for deployments that see spurious ones).
    #[must_use]
    pub fn with_additional_statuses(mut self, statuses: &[u16]) -> Self {
        for status in statuses {
            if !self.retry_status_codes.contains(status) {
                self.retry_status_codes.push(*status);
            }
        }
        self
    }

    /// Validates the policy.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_backoff_ms == 0 {
            return Err("initialBackoffMs must be > 0".to_string());
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err("maxBackoffMs must be >= initialBackoffMs".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("jitterFactor must be in range [0.0, 1.0]".to_string());
        }
        Ok(())
    }

    /// Whether a response status should be retried.
    #[must_use]
    pub fn should_retry(&self, status: u16) -> bool {
        status == 429 || self.retry_status_codes.contains(&status)
    }

    /// Parses a `Retry-After` header. Only the delta-seconds form is supported.
    #[must_use]
    pub fn parse_retry_after(header_value: &str) -> Option<u64> {
        header_value.trim().parse::<u64>().ok()
    }

    /// Exponential delay for a zero-based retry attempt, capped at `max_backoff_ms`.
    #[must_use]
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64;
        let max = self.max_backoff_ms as f64;
        let delay_ms = (base * 2_f64.powi(attempt.min(30) as i32)).min(max);

        Duration::from_millis(delay_ms as u64)
    }

    /// Adds up to `jitter_factor` of extra delay.
    #[must_use]
    pub fn add_jitter(&self, delay: Duration) -> Duration {
        use rand::Rng;

        let delay_ms = delay.as_millis() as f64;
        let jitter_range = delay_ms * self.jitter_factor;
        if jitter_range <= 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=jitter_range);

        Duration::from_millis((delay_ms + jitter) as u64)
    }

    /// Delay before the next attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        match retry_after_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.add_jitter(self.calculate_backoff_delay(attempt)),
        }
    }
}
