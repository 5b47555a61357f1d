//! Stage queue dispatcher.
//!
//! Declares named queues, enqueues deduplicated jobs, and runs worker loops
//! that claim jobs under a renewable lock. A stall checker per queue returns
//! jobs from crashed workers to the queue and fails those that stall too
//! often. Every broker call borrows a slot from one shared pool.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::{Broker, StallReport, STALLED_REASON};
use super::job::{EnqueueOptions, EnqueueOutcome, Job, JobCounts, JobPayload};
use super::options::QueueOptions;
use crate::errors::{BrokerError, ConfigError, DocflowError};
use crate::retry::{RetryLayer, RetryPolicy};
use crate::store::ConnectionPool;

/// Processes jobs claimed from a queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handles one job. An error fails the job.
    async fn handle(&self, job: &Job) -> Result<(), DocflowError>;

    /// Called when a job fails permanently because it stalled too often.
    async fn on_permanent_failure(&self, _job: &Job, _reason: &str) {}
}

fn default_reconnect_policy() -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(10)
        .with_base_delay_ms(500)
        .with_max_delay_ms(10_000)
}

/// Runs stage queues over a [`Broker`].
pub struct StageQueueDispatcher {
    broker: Arc<dyn Broker>,
    pool: Arc<ConnectionPool>,
    defaults: QueueOptions,
    queues: RwLock<HashMap<String, QueueOptions>>,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    retry: RetryLayer,
    reconnect: RetryPolicy,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for StageQueueDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageQueueDispatcher")
            .field("pool", &self.pool.name())
            .field("queues", &self.queues.read().keys().collect::<Vec<_>>())
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl StageQueueDispatcher {
    /// Creates a dispatcher. `pool` is shared by every queue of the process.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, pool: Arc<ConnectionPool>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let reconnect = default_reconnect_policy();
        Self {
            broker,
            pool,
            defaults: QueueOptions::default(),
            queues: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            retry: RetryLayer::new("broker", reconnect.clone()),
            reconnect,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Sets the options used by queues declared without their own.
    #[must_use]
    pub fn with_defaults(mut self, defaults: QueueOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Sets the backoff used on broker disconnects, both for enqueues and
    /// for worker claim loops.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryLayer::new("broker", policy.clone());
        self.reconnect = policy;
        self
    }

    /// The broker.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// The shared broker pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Declares `name`, with the dispatcher defaults when `options` is
    /// `None`. Redeclaring replaces the options for future workers.
    pub fn declare_queue(&self, name: &str, options: Option<QueueOptions>) -> Result<(), ConfigError> {
        let options = options.unwrap_or_else(|| self.defaults.clone());
        options.validate()?;
        debug!(queue = name, "Queue declared");
        self.queues.write().insert(name.to_string(), options);
        Ok(())
    }

    /// Options of a declared queue.
    pub fn queue_options(&self, name: &str) -> Result<QueueOptions, BrokerError> {
        self.queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }

    /// Declared queue names, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Enqueues a job. A job with the same id that is still waiting or
    /// active makes this a no-op. Disconnects are retried with the
    /// reconnect policy.
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, BrokerError> {
        self.queue_options(queue)?;
        let job = Job::new(queue, payload, &options);
        let outcome = self
            .retry
            .call(|_| {
                let job = job.clone();
                async move {
                    let _conn = self.pool.acquire().await?;
                    self.broker.push(job).await
                }
            })
            .await?;
        debug!(
            queue,
            job_id = outcome.job_id(),
            delay_ms = u64::try_from(options.delay.as_millis()).unwrap_or(u64::MAX),
            duplicate = matches!(outcome, EnqueueOutcome::Duplicate(_)),
            "Job enqueued"
        );
        Ok(outcome)
    }

    /// Starts a worker on `queue` running up to `concurrency` jobs at once.
    /// The first worker of a queue also starts its stall checker.
    pub fn register_worker(
        self: &Arc<Self>,
        queue: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), BrokerError> {
        let options = self.queue_options(queue)?;
        let concurrency = concurrency.max(1);
        let first = self
            .handlers
            .write()
            .insert(queue.to_string(), handler.clone())
            .is_none();

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(self).worker_loop(
            queue.to_string(),
            options.clone(),
            concurrency,
            handler,
        )));
        if first {
            tasks.push(tokio::spawn(Arc::clone(self).stall_loop(queue.to_string(), options)));
        }
        info!(queue, concurrency, "Worker registered");
        Ok(())
    }

    /// Runs one stall check on `queue`, notifying its handler about jobs
    /// that failed permanently.
    pub async fn run_stall_check(&self, queue: &str) -> Result<StallReport, BrokerError> {
        let options = self.queue_options(queue)?;
        let report = {
            let _conn = self.pool.acquire().await?;
            self.broker.recover_stalled(queue, options.max_stalled_count).await?
        };
        if !report.failed.is_empty() {
            let handler = self.handlers.read().get(queue).cloned();
            if let Some(handler) = handler {
                for job in &report.failed {
                    handler.on_permanent_failure(job, STALLED_REASON).await;
                }
            }
        }
        Ok(report)
    }

    /// Jobs per state on `queue`.
    pub async fn counts(&self, queue: &str) -> Result<JobCounts, BrokerError> {
        let _conn = self.pool.acquire().await?;
        self.broker.counts(queue).await
    }

    /// Looks up a job.
    pub async fn job(&self, queue: &str, job_id: &str) -> Result<Option<Job>, BrokerError> {
        let _conn = self.pool.acquire().await?;
        self.broker.get(queue, job_id).await
    }

    /// Returns true once `shutdown` was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stops claiming new jobs, waits for in-flight jobs, and stops the
    /// stall checkers.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Dispatcher task ended abnormally");
            }
        }
        // Handlers may hold the owner of this dispatcher.
        self.handlers.write().clear();
        info!("Dispatcher stopped");
    }

    async fn claim(&self, queue: &str, token: Uuid, lock: Duration) -> Result<Option<Job>, BrokerError> {
        let _conn = self.pool.acquire().await?;
        self.broker.claim(queue, token, lock).await
    }

    async fn worker_loop(
        self: Arc<Self>,
        queue: String,
        options: QueueOptions,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let slots = Arc::new(Semaphore::new(concurrency));
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let token = Uuid::new_v4();
            let wait = match self.claim(&queue, token, options.lock_duration()).await {
                Ok(Some(job)) => {
                    if failures > 0 {
                        info!(queue = %queue, failures, "Broker reachable again");
                        failures = 0;
                    }
                    let this = Arc::clone(&self);
                    let handler = Arc::clone(&handler);
                    let options = options.clone();
                    tokio::spawn(async move {
                        this.process(job, token, &options, handler.as_ref()).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => {
                    failures = 0;
                    options.poll_interval()
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.reconnect.next_delay(failures);
                    warn!(
                        queue = %queue,
                        failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Claim failed, backing off"
                    );
                    delay
                }
            };
            drop(permit);

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }
        }

        let all = u32::try_from(concurrency).unwrap_or(u32::MAX);
        if slots.acquire_many(all).await.is_err() {
            warn!(queue = %queue, "Worker slots closed before draining");
        }
        info!(queue = %queue, "Worker stopped");
    }

    async fn process(self: &Arc<Self>, job: Job, token: Uuid, options: &QueueOptions, handler: &dyn JobHandler) {
        debug!(
            queue = %job.queue,
            job_id = %job.id,
            workflow_id = %job.payload.workflow_id,
            stage = %job.payload.stage,
            attempt = job.attempts,
            "Job claimed"
        );

        let renewer = self.spawn_lock_renewal(&job, token, options);
        let result = handler.handle(&job).await;
        renewer.abort();

        let finished = match &result {
            Ok(()) => self.finish(&job, token, None).await,
            Err(e) => {
                warn!(queue = %job.queue, job_id = %job.id, error = %e, "Job handler failed");
                self.finish(&job, token, Some(&e.to_string())).await
            }
        };
        match finished {
            Ok(true) => debug!(queue = %job.queue, job_id = %job.id, ok = result.is_ok(), "Job finished"),
            Ok(false) => warn!(queue = %job.queue, job_id = %job.id, "Job lock lost before it finished"),
            Err(e) => warn!(queue = %job.queue, job_id = %job.id, error = %e, "Could not record job outcome"),
        }
    }

    async fn finish(&self, job: &Job, token: Uuid, failure: Option<&str>) -> Result<bool, BrokerError> {
        let _conn = self.pool.acquire().await?;
        match failure {
            None => self.broker.complete(&job.queue, &job.id, token).await,
            Some(reason) => self.broker.fail(&job.queue, &job.id, token, reason).await,
        }
    }

    fn spawn_lock_renewal(self: &Arc<Self>, job: &Job, token: Uuid, options: &QueueOptions) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let queue = job.queue.clone();
        let job_id = job.id.clone();
        let lock = options.lock_duration();
        let every = options.lock_renew_interval().max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let extended = match this.pool.acquire().await {
                    Ok(_conn) => this.broker.extend_lock(&queue, &job_id, token, lock).await,
                    Err(e) => Err(e.into()),
                };
                match extended {
                    Ok(true) => debug!(queue = %queue, job_id = %job_id, "Job lock extended"),
                    Ok(false) => {
                        warn!(queue = %queue, job_id = %job_id, "Job lock lost");
                        break;
                    }
                    Err(e) => warn!(queue = %queue, job_id = %job_id, error = %e, "Job lock extension failed"),
                }
            }
        })
    }

    async fn stall_loop(self: Arc<Self>, queue: String, options: QueueOptions) {
        let mut shutdown = self.shutdown.subscribe();
        let every = options.stalled_interval();
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.run_stall_check(&queue).await {
                Ok(report) if !report.is_empty() => info!(
                    queue = %queue,
                    requeued = report.requeued.len(),
                    failed = report.failed.len(),
                    "Stalled jobs recovered"
                ),
                Ok(_) => {}
                Err(e) => warn!(queue = %queue, error = %e, "Stall check failed"),
            }
        }
    }
}
