//! The pipeline controller: drives one workflow at a time through the stage
//! graph under its entity lock.
//!
//! Every transition is committed with an assertion on the workflow record as
//! it was read, so racing deliveries of the same stage job cannot both
//! advance the workflow. The loser re-reads and sees the stage completed.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::StageInput;
use super::graph::StageGraph;
use super::registry::StageRegistry;
use super::runner::{ControllerJobHandler, DirectRunner, QueuedRunner, StageJob, StageRunner};
use crate::cancellation::{CancellationRegistry, CancellationScope, CancellationToken};
use crate::config::OrchestratorConfig;
use crate::core::{ExecutionMode, StartRequest, Workflow, WorkflowStatus};
use crate::errors::{ConfigError, DocflowError, ErrorClass, GraphError, StoreError};
use crate::lock::{EntityLockManager, LockToken};
use crate::observability::SpanTimer;
use crate::progress::{LoggingProgressSink, ProgressEvent, ProgressSink};
use crate::queue::StageQueueDispatcher;
use crate::retry::{ErrorClassifier, RetryDecision, RetryLayer, RetryPolicies};
use crate::store::{
    AccumulatedData, ConnectionPool, KvStore, StageResult, Transaction, TransactionRunner,
    WorkflowRepository, WorkflowStateStore,
};

/// Times a transition is re-read and retried after losing an optimistic
/// write race before the conflict is reported.
const OPTIMISTIC_RETRIES: u32 = 3;

/// Result of [`PipelineController::start`].
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// The workflow was created and its first stage handed to the runner.
    Started {
        /// The workflow as last read.
        workflow: Workflow,
    },
    /// Another workflow holds the entity lock.
    Rejected {
        /// The contended entity.
        entity_id: String,
        /// Token of the current holder, if it could be read.
        holder: Option<Uuid>,
    },
}

impl StartOutcome {
    /// The started workflow, if any.
    #[must_use]
    pub fn workflow(&self) -> Option<&Workflow> {
        match self {
            Self::Started { workflow } => Some(workflow),
            Self::Rejected { .. } => None,
        }
    }

    /// Returns true if the request was rejected.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Why a delivery did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoopReason {
    /// The workflow is COMPLETED or FAILED.
    Terminal,
    /// The stage already has a committed result.
    AlreadyCompleted,
    /// The stage is not the workflow's current stage.
    NotCurrent,
    /// Another holder owns the entity lock.
    LockHeld,
    /// A different result for the stage is already stored.
    ConflictingResult,
}

impl NoopReason {
    /// Short name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::AlreadyCompleted => "already_completed",
            Self::NotCurrent => "not_current",
            Self::LockHeld => "lock_held",
            Self::ConflictingResult => "conflicting_result",
        }
    }
}

impl fmt::Display for NoopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`PipelineController::advance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The result was committed and `stage` is scheduled next.
    Next {
        /// Next stage.
        stage: String,
        /// Progress after the completed stage.
        progress: u8,
    },
    /// The last stage finished; the workflow is COMPLETED.
    Completed,
    /// Nothing was written.
    Noop(NoopReason),
}

/// Result of one delivery of one stage job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageRunOutcome {
    /// The stage succeeded.
    Advanced(AdvanceOutcome),
    /// The stage failed transiently; `job` should run after `delay`.
    Retry {
        /// The next attempt.
        job: StageJob,
        /// Backoff before it.
        delay: Duration,
    },
    /// The workflow is now FAILED.
    Failed {
        /// Recorded error message.
        message: String,
    },
    /// The delivery was ignored.
    Skipped(NoopReason),
    /// The entity lock was lost while the stage ran; nothing was written.
    LockLost,
}

impl StageRunOutcome {
    /// The job to run after this one, and when.
    #[must_use]
    pub fn follow_up(&self, job: &StageJob) -> Option<(StageJob, Duration)> {
        match self {
            Self::Advanced(AdvanceOutcome::Next { stage, .. }) => {
                Some((StageJob::new(job.workflow_id, stage.clone()), Duration::ZERO))
            }
            Self::Retry { job, delay } => Some((job.clone(), *delay)),
            _ => None,
        }
    }
}

/// Result of [`PipelineController::redrive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedriveOutcome {
    /// `stage` was scheduled again.
    Redriven {
        /// The re-scheduled stage.
        stage: String,
    },
    /// The workflow already finished.
    Terminal,
    /// Another holder owns the entity lock.
    Locked,
    /// The workflow ran out of re-drives and was failed.
    Failed,
    /// Another writer changed the workflow first.
    Raced,
}

/// Drives workflows through the stage graph.
pub struct PipelineController {
    graph: StageGraph,
    registry: StageRegistry,
    workflows: WorkflowRepository,
    results: WorkflowStateStore,
    transactions: TransactionRunner,
    locks: EntityLockManager,
    progress: Arc<dyn ProgressSink>,
    classifier: Arc<ErrorClassifier>,
    retry: RetryPolicies,
    cancellations: CancellationRegistry,
    config: OrchestratorConfig,
    queued: Option<QueuedRunner>,
    direct: DirectRunner,
}

impl fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineController")
            .field("graph", &self.graph.name())
            .field("stages", &self.graph.stage_names())
            .field("namespace", &self.config.namespace)
            .field("queued", &self.queued.is_some())
            .finish_non_exhaustive()
    }
}

impl PipelineController {
    /// Starts a builder over `kv`.
    #[must_use]
    pub fn builder(kv: Arc<dyn KvStore>) -> PipelineControllerBuilder {
        PipelineControllerBuilder::new(kv)
    }

    /// The stage graph.
    #[must_use]
    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// The stage registry.
    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Workflow records.
    #[must_use]
    pub fn workflows(&self) -> &WorkflowRepository {
        &self.workflows
    }

    /// Stage results.
    #[must_use]
    pub fn results(&self) -> &WorkflowStateStore {
        &self.results
    }

    /// The entity lock manager.
    #[must_use]
    pub fn locks(&self) -> &EntityLockManager {
        &self.locks
    }

    /// The queue dispatcher, when queued execution is configured.
    #[must_use]
    pub fn dispatcher(&self) -> Option<&Arc<StageQueueDispatcher>> {
        self.queued.as_ref().map(QueuedRunner::dispatcher)
    }

    /// The runner for `mode`.
    pub fn runner(&self, mode: ExecutionMode) -> Result<&dyn StageRunner, DocflowError> {
        match mode {
            ExecutionMode::Direct => Ok(&self.direct),
            ExecutionMode::Queued => self
                .queued
                .as_ref()
                .map(|runner| runner as &dyn StageRunner)
                .ok_or_else(|| {
                    ConfigError::invalid("dispatcher", "queued execution requires a dispatcher").into()
                }),
        }
    }

    /// Loads a workflow.
    pub async fn get_workflow(&self, workflow_id: Uuid) -> Result<Workflow, DocflowError> {
        self.workflows
            .get(workflow_id)
            .await?
            .ok_or(DocflowError::WorkflowNotFound(workflow_id))
    }

    /// Merged results of the workflow's completed stages.
    pub async fn accumulated_data(&self, workflow_id: Uuid) -> Result<AccumulatedData, DocflowError> {
        Ok(self.results.get_accumulated_data(workflow_id).await?)
    }

    /// Starts a workflow for `request`.
    ///
    /// In direct mode this returns once the workflow reached a terminal
    /// state; in queued mode once the first stage is enqueued.
    pub async fn start(&self, request: StartRequest, mode: ExecutionMode) -> Result<StartOutcome, DocflowError> {
        request.validate()?;
        let runner = self.runner(mode)?;
        let first = self
            .graph
            .first_stage(&AccumulatedData::default())
            .ok_or_else(|| GraphError::Empty(self.graph.name().to_string()))?
            .to_string();

        let ttl = self.config.lock.ttl();
        let Some(token) = self.locks.acquire(&request.entity_id, ttl).await? else {
            let holder = self
                .locks
                .holder(&request.entity_id)
                .await?
                .map(|lock| lock.holder_token);
            info!(entity_id = %request.entity_id, "Start rejected, entity is locked");
            return Ok(StartOutcome::Rejected {
                entity_id: request.entity_id,
                holder,
            });
        };

        let mut pending = Workflow::new(&request, mode);
        pending.lock = Some(token.clone());
        let running = match self.create(&pending, &first).await {
            Ok(running) => running,
            Err(e) => {
                self.release_lock(Some(&token)).await;
                return Err(e);
            }
        };
        info!(
            workflow_id = %running.id,
            entity_id = %running.entity_id,
            mode = %mode,
            first_stage = %first,
            "Workflow started"
        );
        self.progress.try_emit(ProgressEvent::stage(&running, &first));

        if let Err(e) = runner
            .dispatch(self, StageJob::new(running.id, first.clone()), Duration::ZERO)
            .await
        {
            let message = format!("Could not schedule stage '{first}': {e}");
            self.fail_workflow(running.id, Some(&first), &message).await?;
            return Err(e);
        }

        let workflow = self.get_workflow(running.id).await?;
        Ok(StartOutcome::Started { workflow })
    }

    async fn create(&self, pending: &Workflow, first: &str) -> Result<Workflow, DocflowError> {
        self.workflows.insert(pending).await?;
        let running = pending.begin(first)?;
        let mut tx = Transaction::new("start");
        tx.extend(self.workflows.prepare_update(pending, &running)?);
        self.transactions.commit(tx).await?;
        Ok(running)
    }

    /// Runs one delivery of `job`.
    ///
    /// Stale, duplicate and out-of-order deliveries are skipped. The entity
    /// lock is renewed before and kept alive during execution; if it is lost
    /// nothing is written.
    pub async fn run_stage(&self, job: &StageJob) -> Result<StageRunOutcome, DocflowError> {
        let workflow = self.get_workflow(job.workflow_id).await?;
        if let Some(reason) = skip_reason(&workflow, &job.stage) {
            debug!(workflow_id = %job.workflow_id, stage = %job.stage, reason = %reason, "Stage delivery skipped");
            return Ok(StageRunOutcome::Skipped(reason));
        }

        let Some(workflow) = self.ensure_lock(&workflow).await? else {
            warn!(workflow_id = %job.workflow_id, entity_id = %workflow.entity_id, "Entity locked by another holder");
            return Ok(StageRunOutcome::Skipped(NoopReason::LockHeld));
        };
        let Some(token) = workflow.lock.clone() else {
            return Err(DocflowError::Internal(format!("workflow {} holds no lock", workflow.id)));
        };

        let executor = self.registry.get(&job.stage)?;
        let data = self.results.get_accumulated_data(workflow.id).await?;
        let lock_cancel = Arc::new(CancellationToken::new());
        let scope = CancellationScope::new(vec![self.cancellations.token_for(workflow.id), lock_cancel.clone()]);
        let input = StageInput::new(&workflow, job.stage.clone(), job.attempt, data, scope);

        let keepalive = self.locks.keep_alive(
            token,
            self.config.lock.ttl(),
            self.config.lock.renew_interval(),
            lock_cancel,
        );
        debug!(workflow_id = %workflow.id, stage = %job.stage, attempt = job.attempt, "Executing stage");
        let timer = SpanTimer::start(format!("stage.{}", job.stage));
        let timeout = self.config.stage_timeout();
        let result = tokio::time::timeout(timeout, executor.execute(input)).await;
        let elapsed_ms = timer.finish();
        if keepalive.stop() {
            warn!(workflow_id = %workflow.id, stage = %job.stage, "Entity lock lost during stage, discarding result");
            return Ok(StageRunOutcome::LockLost);
        }

        match result {
            Ok(Ok(outcome)) if outcome.success => {
                info!(workflow_id = %workflow.id, stage = %job.stage, attempt = job.attempt, elapsed_ms, "Stage succeeded");
                let advanced = self
                    .advance(workflow.id, &job.stage, outcome.payload, job.attempt)
                    .await?;
                Ok(StageRunOutcome::Advanced(advanced))
            }
            Ok(Ok(outcome)) => {
                let class = if outcome.retryable {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Fatal
                };
                self.handle_failure(job, class, outcome.error_message()).await
            }
            Ok(Err(error)) => {
                let class = self.classifier.classify(&error);
                self.handle_failure(job, class, &format!("{error:#}")).await
            }
            Err(_) => {
                let message = format!("stage timed out after {}ms", timeout.as_millis());
                self.handle_failure(job, ErrorClass::Retryable, &message).await
            }
        }
    }

    /// Commits `payload` as the result of `stage` and moves the workflow to
    /// the next stage, or to COMPLETED after the last one.
    ///
    /// The next stage is computed before the transaction opens; the
    /// transaction holds only the prepared writes.
    pub async fn advance(
        &self,
        workflow_id: Uuid,
        stage: &str,
        payload: Map<String, Value>,
        attempts: u32,
    ) -> Result<AdvanceOutcome, DocflowError> {
        let result = StageResult::new(workflow_id, stage, payload, attempts);
        for round in 1..=OPTIMISTIC_RETRIES {
            let before = self.get_workflow(workflow_id).await?;
            if let Some(reason) = skip_reason(&before, stage) {
                debug!(%workflow_id, stage, reason = %reason, "Advance skipped");
                return Ok(AdvanceOutcome::Noop(reason));
            }

            let existing = self.results.get_stage_result(workflow_id, stage).await?;
            if let Some(existing) = &existing {
                if !existing.same_payload(&result) {
                    warn!(%workflow_id, stage, "Differing result already stored, keeping the first");
                    return Ok(AdvanceOutcome::Noop(NoopReason::ConflictingResult));
                }
            }

            let data = self
                .results
                .get_accumulated_data(workflow_id)
                .await?
                .with_stage(stage, &result.payload);
            let next = self.graph.next_stage(stage, &data)?.map(str::to_string);
            let progress = self.graph.progress_after(stage)?;
            let mut after = before.complete_stage(stage, next.as_deref(), progress)?;
            if next.is_none() {
                after.lock = None;
            }

            let mut tx = Transaction::new(format!("advance:{stage}"));
            if existing.is_none() {
                tx.push(self.results.prepare_save(&result)?);
            }
            tx.extend(self.workflows.prepare_update(&before, &after)?);
            match self.transactions.commit(tx).await {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    debug!(%workflow_id, stage, round, "Workflow changed concurrently, re-reading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            return Ok(match next {
                Some(next) => {
                    debug!(%workflow_id, stage, next = %next, progress, "Workflow advanced");
                    self.progress
                        .try_emit(ProgressEvent::progress(&after, stage, format!("Stage '{stage}' completed")));
                    self.progress.try_emit(ProgressEvent::stage(&after, &next));
                    AdvanceOutcome::Next { stage: next, progress }
                }
                None => {
                    info!(%workflow_id, entity_id = %after.entity_id, "Workflow completed");
                    self.release_lock(before.lock.as_ref()).await;
                    self.cancellations.remove(workflow_id);
                    self.progress.try_emit(ProgressEvent::completion(&after));
                    AdvanceOutcome::Completed
                }
            });
        }
        Err(StoreError::conflict(self.workflows.key(workflow_id)).into())
    }

    /// Runs one delivery of `job` like [`run_stage`](Self::run_stage), but
    /// errors raised along the way go through the retry policy like stage
    /// failures: retried with backoff while the error is retryable and
    /// attempts remain, otherwise the workflow is failed.
    pub async fn deliver(&self, job: &StageJob) -> Result<StageRunOutcome, DocflowError> {
        match self.run_stage(job).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                warn!(
                    workflow_id = %job.workflow_id,
                    stage = %job.stage,
                    attempt = job.attempt,
                    error = %error,
                    "Stage delivery failed"
                );
                self.handle_failure(job, error.class(), &error.to_string()).await
            }
        }
    }

    /// Decides what follows a failed attempt of `job`: another attempt after
    /// a backoff, or FAILED. Deliveries the workflow moved past are skipped.
    pub async fn handle_failure(
        &self,
        job: &StageJob,
        class: ErrorClass,
        message: &str,
    ) -> Result<StageRunOutcome, DocflowError> {
        let current = match self.get_workflow(job.workflow_id).await {
            Ok(workflow) => {
                if let Some(reason) = skip_reason(&workflow, &job.stage) {
                    return Ok(StageRunOutcome::Skipped(reason));
                }
                Some(workflow)
            }
            Err(e) => {
                debug!(workflow_id = %job.workflow_id, error = %e, "Workflow unreadable while handling failure");
                None
            }
        };

        let policy = self.retry.for_stage(&job.stage);
        let message = match policy.decide(job.attempt, class) {
            RetryDecision::Retry(delay) => {
                warn!(
                    workflow_id = %job.workflow_id,
                    stage = %job.stage,
                    attempt = job.attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = message,
                    "Stage failed, retrying"
                );
                if let Some(workflow) = current {
                    // The sweeper judges liveness by this timestamp.
                    let workflow = match self.touch(&workflow).await {
                        Ok(touched) => touched,
                        Err(e) => {
                            debug!(workflow_id = %job.workflow_id, error = %e, "Could not stamp retry on workflow");
                            workflow
                        }
                    };
                    self.progress.try_emit(ProgressEvent::progress(
                        &workflow,
                        &job.stage,
                        format!("Attempt {} of stage '{}' failed, retrying: {message}", job.attempt, job.stage),
                    ));
                }
                return Ok(StageRunOutcome::Retry {
                    job: job.retry(),
                    delay,
                });
            }
            RetryDecision::GiveUp => {
                format!("Stage '{}' failed after {} attempts: {message}", job.stage, job.attempt)
            }
            RetryDecision::NotRetryable => format!("Stage '{}' failed: {message}", job.stage),
        };

        if self.fail_workflow(job.workflow_id, Some(&job.stage), &message).await? {
            Ok(StageRunOutcome::Failed { message })
        } else {
            Ok(StageRunOutcome::Skipped(NoopReason::Terminal))
        }
    }

    async fn touch(&self, workflow: &Workflow) -> Result<Workflow, DocflowError> {
        let after = workflow.touched();
        let mut tx = Transaction::new("touch");
        tx.extend(self.workflows.prepare_update(workflow, &after)?);
        self.transactions.commit(tx).await?;
        Ok(after)
    }

    /// Moves the workflow to FAILED, trips its cancellation token, releases
    /// its lock and emits an `error` event.
    ///
    /// Returns false if it already was terminal. Only the caller that wins
    /// the transition releases the lock and emits the event.
    pub async fn fail_workflow(
        &self,
        workflow_id: Uuid,
        stage: Option<&str>,
        message: &str,
    ) -> Result<bool, DocflowError> {
        for _ in 0..OPTIMISTIC_RETRIES {
            let before = self.get_workflow(workflow_id).await?;
            if before.is_terminal() {
                return Ok(false);
            }
            let mut after = before.fail(message)?;
            after.lock = None;

            let mut tx = Transaction::new("fail");
            tx.extend(self.workflows.prepare_update(&before, &after)?);
            match self.transactions.commit(tx).await {
                Ok(()) => {}
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }

            warn!(%workflow_id, entity_id = %after.entity_id, error = message, "Workflow failed");
            self.cancellations.cancel(workflow_id, message);
            self.cancellations.remove(workflow_id);
            self.release_lock(before.lock.as_ref()).await;
            let stage = stage.or(before.current_stage.as_deref());
            self.progress.try_emit(ProgressEvent::error(&after, stage, message));
            return Ok(true);
        }
        Err(StoreError::conflict(self.workflows.key(workflow_id)).into())
    }

    /// Cancels a running workflow. It ends FAILED with `reason`.
    pub async fn cancel(&self, workflow_id: Uuid, reason: &str) -> Result<bool, DocflowError> {
        info!(%workflow_id, reason, "Cancelling workflow");
        self.fail_workflow(workflow_id, None, &format!("Cancelled: {reason}")).await
    }

    /// Schedules the current stage of a stuck workflow again.
    ///
    /// A workflow whose own lease is still live is left to its holder; only
    /// lapsed leases are taken over. Workflows re-driven more than
    /// `sweeper.max_redrives` times are failed instead.
    pub async fn redrive(self: &Arc<Self>, workflow_id: Uuid) -> Result<RedriveOutcome, DocflowError> {
        let before = self.get_workflow(workflow_id).await?;
        if before.is_terminal() {
            return Ok(RedriveOutcome::Terminal);
        }
        if let Some(token) = &before.lock {
            if self.locks.is_held_by(token).await? {
                debug!(%workflow_id, entity_id = %before.entity_id, "Workflow still holds its lease");
                return Ok(RedriveOutcome::Locked);
            }
        }
        let max = self.config.sweeper.max_redrives;
        if before.redrive_count >= max {
            let message = format!("Workflow stalled after {max} re-drives");
            self.fail_workflow(workflow_id, None, &message).await?;
            return Ok(RedriveOutcome::Failed);
        }

        let Some(locked) = self.ensure_lock(&before).await? else {
            return Ok(RedriveOutcome::Locked);
        };
        let (stage, after) = match (locked.status, locked.current_stage.clone()) {
            (WorkflowStatus::Running, Some(stage)) => (stage, locked.redriven()),
            _ => {
                let first = self
                    .graph
                    .first_stage(&AccumulatedData::default())
                    .ok_or_else(|| GraphError::Empty(self.graph.name().to_string()))?
                    .to_string();
                let after = locked.begin(&first)?.redriven();
                (first, after)
            }
        };

        let mut tx = Transaction::new("redrive");
        tx.extend(self.workflows.prepare_update(&locked, &after)?);
        match self.transactions.commit(tx).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => return Ok(RedriveOutcome::Raced),
            Err(e) => return Err(e.into()),
        }
        info!(%workflow_id, stage = %stage, redrives = after.redrive_count, "Workflow re-driven");

        let job = StageJob::new(workflow_id, stage.clone());
        match after.execution_mode {
            ExecutionMode::Queued => {
                self.runner(ExecutionMode::Queued)?
                    .dispatch(self, job, Duration::ZERO)
                    .await?;
            }
            ExecutionMode::Direct => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = this.direct.dispatch(&this, job, Duration::ZERO).await {
                        warn!(%workflow_id, error = %e, "Re-driven workflow stopped with an error");
                    }
                });
            }
        }
        Ok(RedriveOutcome::Redriven { stage })
    }

    /// Makes sure the workflow's entity lock is held by it, renewing the
    /// current lease or taking a lapsed one over. Returns the workflow with
    /// its current lock, or `None` if another holder owns the entity.
    pub async fn ensure_lock(&self, workflow: &Workflow) -> Result<Option<Workflow>, DocflowError> {
        let ttl = self.config.lock.ttl();
        let token = match &workflow.lock {
            Some(current) => self.locks.reacquire(current, ttl).await?,
            None => self.locks.acquire(&workflow.entity_id, ttl).await?,
        };
        let Some(token) = token else {
            return Ok(None);
        };
        if workflow.lock.as_ref() == Some(&token) {
            return Ok(Some(workflow.clone()));
        }

        debug!(workflow_id = %workflow.id, entity_id = %workflow.entity_id, "Entity lock re-acquired");
        let after = workflow.with_lock(Some(token.clone()));
        let mut tx = Transaction::new("relock");
        tx.extend(self.workflows.prepare_update(workflow, &after)?);
        if let Err(e) = self.transactions.commit(tx).await {
            self.release_lock(Some(&token)).await;
            return Err(e.into());
        }
        Ok(Some(after))
    }

    /// Registers a queue worker for every queue of the graph.
    pub fn spawn_workers(self: &Arc<Self>) -> Result<(), DocflowError> {
        let Some(dispatcher) = self.dispatcher() else {
            return Err(ConfigError::invalid("dispatcher", "workers require a dispatcher").into());
        };
        let handler = Arc::new(ControllerJobHandler::new(Arc::clone(self)));
        for queue in self.graph.queues() {
            dispatcher.register_worker(&queue, self.config.queue.concurrency, handler.clone())?;
        }
        Ok(())
    }

    /// Stops the queue workers, if any.
    pub async fn shutdown(&self) {
        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.shutdown().await;
        }
    }

    async fn release_lock(&self, token: Option<&LockToken>) {
        let Some(token) = token else {
            return;
        };
        if let Err(e) = self.locks.release(token).await {
            warn!(entity_id = %token.entity_id, error = %e, "Could not release entity lock");
        }
    }
}

fn skip_reason(workflow: &Workflow, stage: &str) -> Option<NoopReason> {
    if workflow.is_terminal() {
        Some(NoopReason::Terminal)
    } else if workflow.has_completed(stage) {
        Some(NoopReason::AlreadyCompleted)
    } else if !workflow.is_current(stage) {
        Some(NoopReason::NotCurrent)
    } else {
        None
    }
}

/// Builder for [`PipelineController`].
pub struct PipelineControllerBuilder {
    kv: Arc<dyn KvStore>,
    graph: Option<StageGraph>,
    registry: Option<StageRegistry>,
    config: OrchestratorConfig,
    pool: Option<Arc<ConnectionPool>>,
    progress: Option<Arc<dyn ProgressSink>>,
    dispatcher: Option<Arc<StageQueueDispatcher>>,
    classifier: Option<ErrorClassifier>,
}

impl fmt::Debug for PipelineControllerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineControllerBuilder")
            .field("graph", &self.graph.as_ref().map(StageGraph::name))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineControllerBuilder {
    fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            graph: None,
            registry: None,
            config: OrchestratorConfig::default(),
            pool: None,
            progress: None,
            dispatcher: None,
            classifier: None,
        }
    }

    /// Sets the stage graph. Defaults to the document pipeline.
    #[must_use]
    pub fn with_graph(mut self, graph: StageGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Sets the stage registry.
    #[must_use]
    pub fn with_registry(mut self, registry: StageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Injects the store connection pool. Without one, a pool that is ready
    /// immediately is created from the configuration.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sets the progress sink.
    #[must_use]
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Enables queued execution over `dispatcher`.
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<StageQueueDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Sets the error classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Validates the parts and builds the controller. Queues of the graph
    /// that the dispatcher does not know yet are declared with the
    /// configured queue defaults.
    pub fn build(self) -> Result<PipelineController, DocflowError> {
        self.config.validate()?;
        let graph = self.graph.unwrap_or_else(StageGraph::document_pipeline);
        let registry = self
            .registry
            .ok_or_else(|| ConfigError::invalid("registry", "a stage registry is required"))?;
        for stage in graph.stage_names() {
            registry.get(&stage)?;
        }
        if let Some(unknown) = registry.stage_names().into_iter().find(|s| !graph.contains(s)) {
            return Err(GraphError::UnknownHandler(unknown).into());
        }

        let config = self.config;
        let namespace = config.namespace.clone();
        let pool = self
            .pool
            .unwrap_or_else(|| ConnectionPool::ready_now(format!("{namespace}-store"), config.pool.clone()));
        let classifier = Arc::new(self.classifier.unwrap_or_default());
        let transactions = TransactionRunner::new(self.kv.clone(), pool, config.transaction.budget()).with_retry(
            RetryLayer::new("transaction", config.transaction.retry.clone()).with_classifier(classifier.clone()),
        );

        if let Some(dispatcher) = &self.dispatcher {
            for queue in graph.queues() {
                if dispatcher.queue_options(&queue).is_err() {
                    dispatcher.declare_queue(&queue, Some(config.queue.clone()))?;
                }
            }
        }

        Ok(PipelineController {
            workflows: WorkflowRepository::new(self.kv.clone()).with_namespace(namespace.clone()),
            results: WorkflowStateStore::new(self.kv.clone())
                .with_namespace(namespace.clone())
                .with_stage_order(graph.stage_names()),
            locks: EntityLockManager::new(self.kv).with_namespace(namespace),
            transactions,
            progress: self
                .progress
                .unwrap_or_else(|| Arc::new(LoggingProgressSink::default())),
            classifier,
            retry: config.retry.clone(),
            cancellations: CancellationRegistry::new(),
            queued: self.dispatcher.map(QueuedRunner::new),
            direct: DirectRunner,
            graph,
            registry,
            config,
        })
    }
}
