//! Job broker trait and the in-process broker.
//!
//! A broker stores jobs per queue and hands them out under a time-limited
//! lock. Delivery is at-least-once: a job whose lock lapses is handed out
//! again by `recover_stalled`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::job::{EnqueueOutcome, Job, JobCounts, JobState};
use crate::errors::BrokerError;

/// Reason recorded on jobs that stalled too often.
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// Jobs moved by one stall check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StallReport {
    /// Jobs returned to the queue.
    pub requeued: Vec<Job>,
    /// Jobs failed permanently.
    pub failed: Vec<Job>,
}

impl StallReport {
    /// Returns true if nothing stalled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Storage and locking of queued jobs.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Stores `job`. A job with the same id that is not yet finished wins;
    /// a finished one is replaced.
    async fn push(&self, job: Job) -> Result<EnqueueOutcome, BrokerError>;

    /// Claims the oldest available job on `queue`, locking it for `lock`.
    async fn claim(&self, queue: &str, token: Uuid, lock: Duration) -> Result<Option<Job>, BrokerError>;

    /// Extends the lock held by `token`. False when the lock is gone.
    async fn extend_lock(&self, queue: &str, job_id: &str, token: Uuid, lock: Duration) -> Result<bool, BrokerError>;

    /// Marks a job completed. False when `token` no longer holds it.
    async fn complete(&self, queue: &str, job_id: &str, token: Uuid) -> Result<bool, BrokerError>;

    /// Marks a job failed. False when `token` no longer holds it.
    async fn fail(&self, queue: &str, job_id: &str, token: Uuid, reason: &str) -> Result<bool, BrokerError>;

    /// Requeues active jobs whose lock expired, failing those that stalled
    /// more than `max_stalled_count` times.
    async fn recover_stalled(&self, queue: &str, max_stalled_count: u32) -> Result<StallReport, BrokerError>;

    /// Looks up a job.
    async fn get(&self, queue: &str, job_id: &str) -> Result<Option<Job>, BrokerError>;

    /// Jobs per state.
    async fn counts(&self, queue: &str) -> Result<JobCounts, BrokerError>;
}

fn lock_expiry(now: DateTime<Utc>, lock: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lock).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// In-process broker.
///
/// Supports simulated disconnects so tests can exercise reconnect paths.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, HashMap<String, Job>>>,
    disconnected: AtomicBool,
    fail_next: AtomicUsize,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail until [`reconnect`](Self::reconnect).
    pub fn simulate_disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// Ends a simulated disconnect.
    pub fn reconnect(&self) {
        self.disconnected.store(false, Ordering::SeqCst);
    }

    /// Makes the next `count` calls fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Total stored jobs across queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.lock().values().map(HashMap::len).sum()
    }

    /// Returns true if no jobs are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forces the lock of an active job to lapse now.
    pub fn expire_lock(&self, queue: &str, job_id: &str) -> bool {
        let mut queues = self.queues.lock();
        match queues.get_mut(queue).and_then(|jobs| jobs.get_mut(job_id)) {
            Some(job) if job.state == JobState::Active => {
                job.lock_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
                true
            }
            _ => false,
        }
    }

    fn check_connection(&self) -> Result<(), BrokerError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected("connection refused".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(BrokerError::Disconnected("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn finish(
        &self,
        queue: &str,
        job_id: &str,
        token: Uuid,
        state: JobState,
        reason: Option<&str>,
    ) -> Result<bool, BrokerError> {
        self.check_connection()?;
        let mut queues = self.queues.lock();
        let Some(job) = queues.get_mut(queue).and_then(|jobs| jobs.get_mut(job_id)) else {
            return Ok(false);
        };
        if !job.is_locked_by(token) {
            return Ok(false);
        }
        job.state = state;
        job.lock_token = None;
        job.lock_expires_at = None;
        job.failed_reason = reason.map(str::to_string);
        job.finished_at = Some(Utc::now());
        Ok(true)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, job: Job) -> Result<EnqueueOutcome, BrokerError> {
        self.check_connection()?;
        let mut queues = self.queues.lock();
        let jobs = queues.entry(job.queue.clone()).or_default();
        if let Some(existing) = jobs.get(&job.id) {
            if !existing.state.is_terminal() {
                debug!(queue = %job.queue, job_id = %job.id, "Duplicate job ignored");
                return Ok(EnqueueOutcome::Duplicate(job.id));
            }
        }
        let id = job.id.clone();
        jobs.insert(id.clone(), job);
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn claim(&self, queue: &str, token: Uuid, lock: Duration) -> Result<Option<Job>, BrokerError> {
        self.check_connection()?;
        let now = Utc::now();
        let mut queues = self.queues.lock();
        let Some(jobs) = queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some(job) = jobs
            .values_mut()
            .filter(|job| job.is_available(now))
            .min_by_key(|job| (job.available_at, job.created_at))
        else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.lock_token = Some(token);
        job.lock_expires_at = Some(lock_expiry(now, lock));
        Ok(Some(job.clone()))
    }

    async fn extend_lock(&self, queue: &str, job_id: &str, token: Uuid, lock: Duration) -> Result<bool, BrokerError> {
        self.check_connection()?;
        let mut queues = self.queues.lock();
        match queues.get_mut(queue).and_then(|jobs| jobs.get_mut(job_id)) {
            Some(job) if job.is_locked_by(token) => {
                job.lock_expires_at = Some(lock_expiry(Utc::now(), lock));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, queue: &str, job_id: &str, token: Uuid) -> Result<bool, BrokerError> {
        self.finish(queue, job_id, token, JobState::Completed, None)
    }

    async fn fail(&self, queue: &str, job_id: &str, token: Uuid, reason: &str) -> Result<bool, BrokerError> {
        self.finish(queue, job_id, token, JobState::Failed, Some(reason))
    }

    async fn recover_stalled(&self, queue: &str, max_stalled_count: u32) -> Result<StallReport, BrokerError> {
        self.check_connection()?;
        let now = Utc::now();
        let mut report = StallReport::default();
        let mut queues = self.queues.lock();
        let Some(jobs) = queues.get_mut(queue) else {
            return Ok(report);
        };

        for job in jobs.values_mut() {
            let expired = job.state == JobState::Active && job.lock_expires_at.is_some_and(|at| at <= now);
            if !expired {
                continue;
            }
            job.stalled_count += 1;
            job.lock_token = None;
            job.lock_expires_at = None;
            if job.stalled_count > max_stalled_count {
                warn!(queue, job_id = %job.id, stalled = job.stalled_count, "Job failed after stalling");
                job.state = JobState::Failed;
                job.failed_reason = Some(STALLED_REASON.to_string());
                job.finished_at = Some(now);
                report.failed.push(job.clone());
            } else {
                warn!(queue, job_id = %job.id, stalled = job.stalled_count, "Stalled job requeued");
                job.state = JobState::Stalled;
                job.available_at = now;
                report.requeued.push(job.clone());
            }
        }
        Ok(report)
    }

    async fn get(&self, queue: &str, job_id: &str) -> Result<Option<Job>, BrokerError> {
        self.check_connection()?;
        Ok(self
            .queues
            .lock()
            .get(queue)
            .and_then(|jobs| jobs.get(job_id))
            .cloned())
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, BrokerError> {
        self.check_connection()?;
        let mut counts = JobCounts::default();
        if let Some(jobs) = self.queues.lock().get(queue) {
            for job in jobs.values() {
                match job.state {
                    JobState::Waiting => counts.waiting += 1,
                    JobState::Active => counts.active += 1,
                    JobState::Completed => counts.completed += 1,
                    JobState::Failed => counts.failed += 1,
                    JobState::Stalled => counts.stalled += 1,
                }
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EnqueueOptions, JobPayload};

    const LOCK: Duration = Duration::from_secs(60);

    fn job(stage: &str) -> Job {
        Job::new("q", JobPayload::new(Uuid::now_v7(), stage), &EnqueueOptions::new())
    }

    #[tokio::test]
    async fn test_push_dedupes_live_jobs() {
        let broker = MemoryBroker::new();
        let first = job("a");
        let mut again = first.clone();
        again.payload.data = serde_json::json!({"second": true});

        assert!(matches!(broker.push(first.clone()).await.unwrap(), EnqueueOutcome::Enqueued(_)));
        assert!(matches!(broker.push(again).await.unwrap(), EnqueueOutcome::Duplicate(_)));
        assert_eq!(broker.len(), 1);
    }

    #[tokio::test]
    async fn test_push_replaces_finished_job() {
        let broker = MemoryBroker::new();
        let first = job("a");
        broker.push(first.clone()).await.unwrap();
        let token = Uuid::new_v4();
        broker.claim("q", token, LOCK).await.unwrap().unwrap();
        assert!(broker.complete("q", &first.id, token).await.unwrap());

        assert!(matches!(broker.push(first.clone()).await.unwrap(), EnqueueOutcome::Enqueued(_)));
        assert_eq!(broker.get("q", &first.id).await.unwrap().unwrap().state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_and_ordered() {
        let broker = MemoryBroker::new();
        let mut first = job("a");
        first.created_at -= chrono::Duration::seconds(1);
        first.available_at = first.created_at;
        broker.push(first.clone()).await.unwrap();
        broker.push(job("b")).await.unwrap();

        let claimed = broker.claim("q", Uuid::new_v4(), LOCK).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.state, JobState::Active);
        let second = broker.claim("q", Uuid::new_v4(), LOCK).await.unwrap().unwrap();
        assert_ne!(second.id, first.id);
        assert!(broker.claim("q", Uuid::new_v4(), LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_job_not_claimed() {
        let broker = MemoryBroker::new();
        let delayed = Job::new(
            "q",
            JobPayload::new(Uuid::now_v7(), "a"),
            &EnqueueOptions::new().with_delay(Duration::from_secs(30)),
        );
        broker.push(delayed).await.unwrap();
        assert!(broker.claim("q", Uuid::new_v4(), LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_only_holder_can_finish() {
        let broker = MemoryBroker::new();
        let queued = job("a");
        broker.push(queued.clone()).await.unwrap();
        let token = Uuid::new_v4();
        broker.claim("q", token, LOCK).await.unwrap();

        assert!(!broker.complete("q", &queued.id, Uuid::new_v4()).await.unwrap());
        assert!(broker.extend_lock("q", &queued.id, token, LOCK).await.unwrap());
        assert!(broker.fail("q", &queued.id, token, "boom").await.unwrap());

        let stored = broker.get("q", &queued.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.failed_reason.as_deref(), Some("boom"));
        assert!(!broker.extend_lock("q", &queued.id, token, LOCK).await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_stalled_requeues_then_fails() {
        let broker = MemoryBroker::new();
        let queued = job("a");
        broker.push(queued.clone()).await.unwrap();

        let stale = Uuid::new_v4();
        broker.claim("q", stale, LOCK).await.unwrap();
        assert!(broker.recover_stalled("q", 1).await.unwrap().is_empty());

        broker.expire_lock("q", &queued.id);
        let report = broker.recover_stalled("q", 1).await.unwrap();
        assert_eq!(report.requeued.len(), 1);
        assert_eq!(report.requeued[0].stalled_count, 1);

        // The stale worker can no longer complete the job.
        assert!(!broker.complete("q", &queued.id, stale).await.unwrap());

        broker.claim("q", Uuid::new_v4(), LOCK).await.unwrap().unwrap();
        broker.expire_lock("q", &queued.id);
        let report = broker.recover_stalled("q", 1).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].failed_reason.as_deref(), Some(STALLED_REASON));
    }

    #[tokio::test]
    async fn test_disconnect_and_fail_next() {
        let broker = MemoryBroker::new();
        broker.simulate_disconnect();
        assert!(matches!(broker.push(job("a")).await, Err(BrokerError::Disconnected(_))));
        broker.reconnect();
        broker.fail_next(1);
        assert!(broker.counts("q").await.is_err());
        assert_eq!(broker.counts("q").await.unwrap(), JobCounts::default());
    }

    #[tokio::test]
    async fn test_counts() {
        let broker = MemoryBroker::new();
        broker.push(job("a")).await.unwrap();
        broker.push(job("b")).await.unwrap();
        broker.claim("q", Uuid::new_v4(), LOCK).await.unwrap();
        let counts = broker.counts("q").await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.active, 1);
    }
}
