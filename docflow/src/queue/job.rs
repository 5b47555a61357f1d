//! Jobs carried by the stage queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle of a job inside the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be claimed once `available_at` passes.
    Waiting,
    /// Claimed by a worker that holds its lock.
    Active,
    /// Finished successfully.
    Completed,
    /// Failed permanently.
    Failed,
    /// Its lock expired while active; waiting to be claimed again.
    Stalled,
}

impl JobState {
    /// Returns true for COMPLETED and FAILED.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if a worker may claim the job.
    #[must_use]
    pub const fn is_claimable(self) -> bool {
        matches!(self, Self::Waiting | Self::Stalled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stalled => "stalled",
        };
        f.write_str(s)
    }
}

/// What a stage job asks a worker to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Workflow to advance.
    pub workflow_id: Uuid,
    /// Stage to run.
    pub stage: String,
    /// Extra data for the handler.
    #[serde(default)]
    pub data: Value,
}

impl JobPayload {
    /// Creates a payload without extra data.
    #[must_use]
    pub fn new(workflow_id: Uuid, stage: impl Into<String>) -> Self {
        Self {
            workflow_id,
            stage: stage.into(),
            data: Value::Null,
        }
    }
}

/// A job on a named queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Deduplication id.
    pub id: String,
    /// Queue name.
    pub queue: String,
    /// Work description.
    pub payload: JobPayload,
    /// Stage attempt this job carries (1-based).
    pub attempts: u32,
    /// Times the job was found stalled.
    pub stalled_count: u32,
    /// Current state.
    pub state: JobState,
    /// Token of the worker holding the job lock.
    pub lock_token: Option<Uuid>,
    /// When the job lock lapses.
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Earliest claim time.
    pub available_at: DateTime<Utc>,
    /// Why the job failed.
    pub failed_reason: Option<String>,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Terminal time.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a waiting job.
    #[must_use]
    pub fn new(queue: impl Into<String>, payload: JobPayload, options: &EnqueueOptions) -> Self {
        let now = Utc::now();
        let attempts = options.attempts.max(1);
        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| job_id(payload.workflow_id, &payload.stage, attempts));
        let delay = chrono::Duration::from_std(options.delay).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            id,
            queue: queue.into(),
            payload,
            attempts,
            stalled_count: 0,
            state: JobState::Waiting,
            lock_token: None,
            lock_expires_at: None,
            available_at: now + delay,
            failed_reason: None,
            created_at: now,
            finished_at: None,
        }
    }

    /// Returns true if the job can be claimed at `now`.
    #[must_use]
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.state.is_claimable() && self.available_at <= now
    }

    /// Returns true if `token` holds the job lock.
    #[must_use]
    pub fn is_locked_by(&self, token: Uuid) -> bool {
        self.state == JobState::Active && self.lock_token == Some(token)
    }
}

/// Deterministic job id for one attempt of one stage of one workflow.
///
/// Re-enqueueing the same attempt yields the same id, so duplicates collapse
/// in the broker.
#[must_use]
pub fn job_id(workflow_id: Uuid, stage: &str, attempt: u32) -> String {
    let digest = Sha256::digest(format!("{workflow_id}:{stage}:{attempt}").as_bytes());
    format!("job:{}", hex::encode(&digest[..16]))
}

/// Options for `enqueue`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Explicit job id. Derived from the payload when absent.
    pub job_id: Option<String>,
    /// Delay before the job becomes claimable.
    pub delay: Duration,
    /// Stage attempt carried by the job.
    pub attempts: u32,
}

impl EnqueueOptions {
    /// Creates options for the first attempt without delay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Sets the job id.
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Sets the delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the attempt number.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job was stored.
    Enqueued(String),
    /// A live job with the same id already exists.
    Duplicate(String),
}

impl EnqueueOutcome {
    /// The job id.
    #[must_use]
    pub fn job_id(&self) -> &str {
        match self {
            Self::Enqueued(id) | Self::Duplicate(id) => id,
        }
    }
}

/// Jobs per state on one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    /// Waiting jobs.
    pub waiting: usize,
    /// Active jobs.
    pub active: usize,
    /// Completed jobs.
    pub completed: usize,
    /// Failed jobs.
    pub failed: usize,
    /// Stalled jobs waiting to be reclaimed.
    pub stalled: usize,
}
