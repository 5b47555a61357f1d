//! Orchestrator configuration.
//!
//! Every field has a default, so a partial JSON document (or none at all)
//! yields a usable configuration. Durations are stored as fractional
//! seconds and exposed as [`Duration`] getters.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::queue::QueueOptions;
use crate::retry::{RetryPolicies, RetryPolicy};
use crate::store::PoolOptions;

fn default_namespace() -> String {
    "docflow".to_string()
}

fn default_lock_ttl_seconds() -> f64 {
    300.0
}

fn default_lock_renew_interval_seconds() -> f64 {
    60.0
}

fn default_transaction_budget_seconds() -> f64 {
    5.0
}

fn default_transaction_retry() -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(3)
        .with_base_delay_ms(100)
        .with_max_delay_ms(2_000)
}

fn default_reconnect() -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(10)
        .with_base_delay_ms(500)
        .with_max_delay_ms(10_000)
}

fn default_broker_pool() -> PoolOptions {
    PoolOptions::new().with_size(4)
}

fn default_channel_capacity() -> usize {
    crate::progress::DEFAULT_CHANNEL_CAPACITY
}

fn default_heartbeat_seconds() -> f64 {
    15.0
}

fn default_stale_after_seconds() -> f64 {
    600.0
}

fn default_sweep_interval_seconds() -> f64 {
    60.0
}

fn default_batch_limit() -> usize {
    100
}

fn default_max_redrives() -> u32 {
    3
}

fn default_stage_timeout_seconds() -> f64 {
    300.0
}

fn duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}

fn positive(field: &str, seconds: f64) -> Result<(), ConfigError> {
    if seconds.is_finite() && seconds > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, "must be a positive number of seconds"))
    }
}

fn attempts(field: &str, policy: &RetryPolicy) -> Result<(), ConfigError> {
    if policy.max_attempts == 0 {
        return Err(ConfigError::invalid(field, "max_attempts must be at least 1"));
    }
    if policy.base_delay_ms > policy.max_delay_ms {
        return Err(ConfigError::invalid(field, "base_delay_ms exceeds max_delay_ms"));
    }
    Ok(())
}

/// Entity lock lease settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease length.
    #[serde(default = "default_lock_ttl_seconds")]
    pub ttl_seconds: f64,
    /// How often a running stage renews the lease.
    #[serde(default = "default_lock_renew_interval_seconds")]
    pub renew_interval_seconds: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_lock_ttl_seconds(),
            renew_interval_seconds: default_lock_renew_interval_seconds(),
        }
    }
}

impl LockConfig {
    /// Lease length.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        duration(self.ttl_seconds)
    }

    /// Renewal interval.
    #[must_use]
    pub fn renew_interval(&self) -> Duration {
        duration(self.renew_interval_seconds)
    }
}

/// Stage persistence transaction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Hard time budget of one commit.
    #[serde(default = "default_transaction_budget_seconds")]
    pub budget_seconds: f64,
    /// Retry of transient commit failures.
    #[serde(default = "default_transaction_retry")]
    pub retry: RetryPolicy,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            budget_seconds: default_transaction_budget_seconds(),
            retry: default_transaction_retry(),
        }
    }
}

impl TransactionConfig {
    /// Commit budget.
    #[must_use]
    pub fn budget(&self) -> Duration {
        duration(self.budget_seconds)
    }
}

/// Progress publisher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Events buffered per topic before slow subscribers skip.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// SSE heartbeat interval.
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            heartbeat_seconds: default_heartbeat_seconds(),
        }
    }
}

impl ProgressConfig {
    /// Heartbeat interval.
    #[must_use]
    pub fn heartbeat(&self) -> Duration {
        duration(self.heartbeat_seconds)
    }
}

/// Stuck workflow sweeper settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// A non-terminal workflow untouched for this long is stuck.
    #[serde(default = "default_stale_after_seconds")]
    pub stale_after_seconds: f64,
    /// Time between sweeps.
    #[serde(default = "default_sweep_interval_seconds")]
    pub interval_seconds: f64,
    /// Maximum workflows re-driven per sweep.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    /// Re-drives before a stuck workflow is failed instead.
    #[serde(default = "default_max_redrives")]
    pub max_redrives: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            stale_after_seconds: default_stale_after_seconds(),
            interval_seconds: default_sweep_interval_seconds(),
            batch_limit: default_batch_limit(),
            max_redrives: default_max_redrives(),
        }
    }
}

impl SweeperConfig {
    /// Staleness threshold.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        duration(self.stale_after_seconds)
    }

    /// Sweep interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        duration(self.interval_seconds)
    }
}

/// Top-level configuration of the orchestration engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Key prefix in the durable store.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Entity lock.
    #[serde(default)]
    pub lock: LockConfig,
    /// Default options of every stage queue.
    #[serde(default)]
    pub queue: QueueOptions,
    /// Stage retry policies.
    #[serde(default)]
    pub retry: RetryPolicies,
    /// Stage persistence transaction.
    #[serde(default)]
    pub transaction: TransactionConfig,
    /// Backoff on broker disconnects.
    #[serde(default = "default_reconnect")]
    pub reconnect: RetryPolicy,
    /// Store connection pool.
    #[serde(default)]
    pub pool: PoolOptions,
    /// Broker connection pool shared by all queues.
    #[serde(default = "default_broker_pool")]
    pub broker_pool: PoolOptions,
    /// Progress publisher.
    #[serde(default)]
    pub progress: ProgressConfig,
    /// Stuck workflow sweeper.
    #[serde(default)]
    pub sweeper: SweeperConfig,
    /// Upper bound on one stage attempt.
    #[serde(default = "default_stage_timeout_seconds")]
    pub stage_timeout_seconds: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            lock: LockConfig::default(),
            queue: QueueOptions::default(),
            retry: RetryPolicies::default(),
            transaction: TransactionConfig::default(),
            reconnect: default_reconnect(),
            pool: PoolOptions::default(),
            broker_pool: default_broker_pool(),
            progress: ProgressConfig::default(),
            sweeper: SweeperConfig::default(),
            stage_timeout_seconds: default_stage_timeout_seconds(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Sets the key namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the lock lease and renewal interval.
    #[must_use]
    pub fn with_lock(mut self, ttl: Duration, renew_interval: Duration) -> Self {
        self.lock.ttl_seconds = ttl.as_secs_f64();
        self.lock.renew_interval_seconds = renew_interval.as_secs_f64();
        self
    }

    /// Sets the default queue options.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueOptions) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the stage retry policies.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicies) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the transaction budget.
    #[must_use]
    pub fn with_transaction_budget(mut self, budget: Duration) -> Self {
        self.transaction.budget_seconds = budget.as_secs_f64();
        self
    }

    /// Sets the transaction retry policy.
    #[must_use]
    pub fn with_transaction_retry(mut self, policy: RetryPolicy) -> Self {
        self.transaction.retry = policy;
        self
    }

    /// Sets the broker reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Sets the sweeper settings.
    #[must_use]
    pub fn with_sweeper(mut self, sweeper: SweeperConfig) -> Self {
        self.sweeper = sweeper;
        self
    }

    /// Sets the per-attempt stage timeout.
    #[must_use]
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_seconds = timeout.as_secs_f64();
        self
    }

    /// Per-attempt stage timeout.
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        duration(self.stage_timeout_seconds)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::invalid("namespace", "must not be empty"));
        }
        positive("lock.ttl_seconds", self.lock.ttl_seconds)?;
        positive("lock.renew_interval_seconds", self.lock.renew_interval_seconds)?;
        if self.lock.renew_interval_seconds >= self.lock.ttl_seconds {
            return Err(ConfigError::invalid(
                "lock.renew_interval_seconds",
                "must be shorter than lock.ttl_seconds",
            ));
        }
        self.queue.validate()?;
        attempts("retry.default", &self.retry.default)?;
        for (stage, policy) in &self.retry.stages {
            attempts(&format!("retry.stages.{stage}"), policy)?;
        }
        positive("transaction.budget_seconds", self.transaction.budget_seconds)?;
        attempts("transaction.retry", &self.transaction.retry)?;
        attempts("reconnect", &self.reconnect)?;
        for (field, pool) in [("pool", &self.pool), ("broker_pool", &self.broker_pool)] {
            if pool.size == 0 {
                return Err(ConfigError::invalid(format!("{field}.size"), "must be at least 1"));
            }
            positive(&format!("{field}.acquire_timeout_seconds"), pool.acquire_timeout_seconds)?;
            positive(&format!("{field}.ready_timeout_seconds"), pool.ready_timeout_seconds)?;
        }
        if self.progress.channel_capacity == 0 {
            return Err(ConfigError::invalid("progress.channel_capacity", "must be at least 1"));
        }
        positive("progress.heartbeat_seconds", self.progress.heartbeat_seconds)?;
        positive("sweeper.stale_after_seconds", self.sweeper.stale_after_seconds)?;
        positive("sweeper.interval_seconds", self.sweeper.interval_seconds)?;
        if self.sweeper.batch_limit == 0 {
            return Err(ConfigError::invalid("sweeper.batch_limit", "must be at least 1"));
        }
        positive("stage_timeout_seconds", self.stage_timeout_seconds)?;
        Ok(())
    }
}
