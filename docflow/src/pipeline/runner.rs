//! How scheduled stages get executed: through the stage queues, or inline
//! in the caller's task.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::controller::PipelineController;
use crate::core::ExecutionMode;
use crate::errors::DocflowError;
use crate::queue::{EnqueueOptions, Job, JobHandler, JobPayload, StageQueueDispatcher};

/// One scheduled attempt of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageJob {
    /// Workflow to advance.
    pub workflow_id: Uuid,
    /// Stage to run.
    pub stage: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl StageJob {
    /// The first attempt of `stage`.
    #[must_use]
    pub fn new(workflow_id: Uuid, stage: impl Into<String>) -> Self {
        Self {
            workflow_id,
            stage: stage.into(),
            attempt: 1,
        }
    }

    /// The next attempt of the same stage.
    #[must_use]
    pub fn retry(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// Reads a stage job back from a queue job.
    #[must_use]
    pub fn from_job(job: &Job) -> Self {
        Self {
            workflow_id: job.payload.workflow_id,
            stage: job.payload.stage.clone(),
            attempt: job.attempts.max(1),
        }
    }

    /// The queue payload.
    #[must_use]
    pub fn payload(&self) -> JobPayload {
        JobPayload::new(self.workflow_id, self.stage.clone())
    }
}

/// Executes scheduled stages.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// The execution mode this runner implements.
    fn mode(&self) -> ExecutionMode;

    /// Runs `job` after `delay`.
    async fn dispatch(
        &self,
        controller: &PipelineController,
        job: StageJob,
        delay: Duration,
    ) -> Result<(), DocflowError>;
}

/// Hands stages to the queue workers.
#[derive(Debug, Clone)]
pub struct QueuedRunner {
    dispatcher: Arc<StageQueueDispatcher>,
}

impl QueuedRunner {
    /// Creates a runner over `dispatcher`.
    #[must_use]
    pub fn new(dispatcher: Arc<StageQueueDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// The dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<StageQueueDispatcher> {
        &self.dispatcher
    }
}

#[async_trait]
impl StageRunner for QueuedRunner {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Queued
    }

    async fn dispatch(
        &self,
        controller: &PipelineController,
        job: StageJob,
        delay: Duration,
    ) -> Result<(), DocflowError> {
        let queue = controller.graph().queue_for(&job.stage)?;
        let options = EnqueueOptions::new().with_delay(delay).with_attempts(job.attempt);
        let outcome = self.dispatcher.enqueue(queue, job.payload(), options).await?;
        debug!(
            workflow_id = %job.workflow_id,
            stage = %job.stage,
            attempt = job.attempt,
            queue,
            job_id = outcome.job_id(),
            "Stage scheduled"
        );
        Ok(())
    }
}

/// Runs stages one after another in the caller's task, sleeping between
/// retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectRunner;

#[async_trait]
impl StageRunner for DirectRunner {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Direct
    }

    async fn dispatch(
        &self,
        controller: &PipelineController,
        job: StageJob,
        delay: Duration,
    ) -> Result<(), DocflowError> {
        let mut next = Some((job, delay));
        while let Some((job, delay)) = next {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = controller.deliver(&job).await?;
            next = outcome.follow_up(&job);
        }
        Ok(())
    }
}

/// Queue handler that runs stage jobs through the controller and schedules
/// what follows them.
#[derive(Debug, Clone)]
pub struct ControllerJobHandler {
    controller: Arc<PipelineController>,
}

impl ControllerJobHandler {
    /// Creates a handler for `controller`.
    #[must_use]
    pub fn new(controller: Arc<PipelineController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl JobHandler for ControllerJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), DocflowError> {
        let stage_job = StageJob::from_job(job);
        let outcome = self.controller.deliver(&stage_job).await?;
        if let Some((next, delay)) = outcome.follow_up(&stage_job) {
            self.controller
                .runner(ExecutionMode::Queued)?
                .dispatch(&self.controller, next, delay)
                .await?;
        }
        Ok(())
    }

    async fn on_permanent_failure(&self, job: &Job, reason: &str) {
        let stage_job = StageJob::from_job(job);
        let message = format!("Stage '{}' job failed permanently: {reason}", stage_job.stage);
        if let Err(e) = self
            .controller
            .fail_workflow(stage_job.workflow_id, Some(&stage_job.stage), &message)
            .await
        {
            warn!(workflow_id = %stage_job.workflow_id, error = %e, "Could not fail workflow of stalled job");
        }
    }
}
