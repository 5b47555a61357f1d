//! Per-queue worker options.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::errors::ConfigError;

fn default_concurrency() -> usize {
    4
}

fn default_lock_duration_seconds() -> f64 {
    120.0
}

fn default_stalled_interval_seconds() -> f64 {
    30.0
}

fn default_max_stalled_count() -> u32 {
    1
}

fn default_poll_interval_seconds() -> f64 {
    0.25
}

/// Lock and stall settings shorter than this risk stalling jobs during a
/// cold start.
const MIN_SAFE_LOCK_SECONDS: f64 = 60.0;

/// Worker settings for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Jobs processed in parallel by one worker.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// How long a claimed job stays locked without renewal.
    #[serde(default = "default_lock_duration_seconds")]
    pub lock_duration_seconds: f64,
    /// How often expired job locks are checked.
    #[serde(default = "default_stalled_interval_seconds")]
    pub stalled_interval_seconds: f64,
    /// Times a job may stall before it fails permanently.
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,
    /// Idle wait between claims on an empty queue.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: f64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            lock_duration_seconds: default_lock_duration_seconds(),
            stalled_interval_seconds: default_stalled_interval_seconds(),
            max_stalled_count: default_max_stalled_count(),
            poll_interval_seconds: default_poll_interval_seconds(),
        }
    }
}

impl QueueOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the job lock duration.
    #[must_use]
    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration_seconds = duration.as_secs_f64();
        self
    }

    /// Sets the stall check interval.
    #[must_use]
    pub fn with_stalled_interval(mut self, interval: Duration) -> Self {
        self.stalled_interval_seconds = interval.as_secs_f64();
        self
    }

    /// Sets the maximum stall count.
    #[must_use]
    pub fn with_max_stalled_count(mut self, count: u32) -> Self {
        self.max_stalled_count = count;
        self
    }

    /// Sets the idle poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_seconds = interval.as_secs_f64();
        self
    }

    /// Job lock duration.
    #[must_use]
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs_f64(self.lock_duration_seconds.max(0.0))
    }

    /// Interval at which a running job renews its lock.
    #[must_use]
    pub fn lock_renew_interval(&self) -> Duration {
        self.lock_duration() / 2
    }

    /// Stall check interval.
    #[must_use]
    pub fn stalled_interval(&self) -> Duration {
        Duration::from_secs_f64(self.stalled_interval_seconds.max(0.0))
    }

    /// Idle poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds.max(0.0))
    }

    /// Rejects unusable values. Short locks are allowed but logged.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::invalid("queue.concurrency", "must be at least 1"));
        }
        for (field, value) in [
            ("queue.lock_duration_seconds", self.lock_duration_seconds),
            ("queue.stalled_interval_seconds", self.stalled_interval_seconds),
            ("queue.poll_interval_seconds", self.poll_interval_seconds),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::invalid(field, "must be a positive number of seconds"));
            }
        }
        if self.lock_duration_seconds < MIN_SAFE_LOCK_SECONDS {
            warn!(
                lock_duration_seconds = self.lock_duration_seconds,
                "Job lock shorter than {MIN_SAFE_LOCK_SECONDS}s; slow stages may stall"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = QueueOptions::default();
        assert_eq!(options.lock_duration(), Duration::from_secs(120));
        assert_eq!(options.lock_renew_interval(), Duration::from_secs(60));
        assert_eq!(options.stalled_interval(), Duration::from_secs(30));
        assert_eq!(options.max_stalled_count, 1);
        assert_eq!(options.poll_interval(), Duration::from_millis(250));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(QueueOptions::new().with_concurrency(0).validate().is_err());
        let mut options = QueueOptions::new();
        options.stalled_interval_seconds = 0.0;
        assert!(options.validate().is_err());
        options = QueueOptions::new();
        options.lock_duration_seconds = f64::NAN;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_short_lock_still_valid() {
        let options = QueueOptions::new().with_lock_duration(Duration::from_millis(200));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: QueueOptions = serde_json::from_str(r#"{"concurrency": 2}"#).unwrap();
        assert_eq!(options.concurrency, 2);
        assert_eq!(options.lock_duration_seconds, 120.0);
    }
}
