//! Periodic driver that re-drives workflows whose stage job was lost.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::controller::{PipelineController, RedriveOutcome};
use crate::config::SweeperConfig;
use crate::core::WorkflowStatus;
use crate::errors::DocflowError;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Non-terminal workflows older than the threshold.
    pub stale: usize,
    /// Workflows whose current stage was scheduled again.
    pub redriven: Vec<Uuid>,
    /// Workflows failed after too many re-drives.
    pub failed: Vec<Uuid>,
    /// Workflows skipped because another holder owns their entity.
    pub locked: Vec<Uuid>,
    /// Workflows that could not be re-driven this time.
    pub errors: usize,
}

impl SweepReport {
    /// Returns true if the sweep changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.redriven.is_empty() && self.failed.is_empty()
    }
}

/// Finds PENDING and RUNNING workflows that stopped moving and re-drives
/// them through the controller.
#[derive(Debug, Clone)]
pub struct StuckWorkflowSweeper {
    controller: Arc<PipelineController>,
    config: SweeperConfig,
}

impl StuckWorkflowSweeper {
    /// Creates a sweeper with the controller's sweeper settings.
    #[must_use]
    pub fn new(controller: Arc<PipelineController>) -> Self {
        let config = controller.config().sweeper.clone();
        Self { controller, config }
    }

    /// Overrides the sweeper settings.
    #[must_use]
    pub fn with_config(mut self, config: SweeperConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs one sweep. Oldest workflows go first, at most `batch_limit` of
    /// them.
    pub async fn sweep_once(&self) -> Result<SweepReport, DocflowError> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - stale_after;

        let mut stale: Vec<_> = self
            .controller
            .workflows()
            .list_by_status(&[WorkflowStatus::Pending, WorkflowStatus::Running])
            .await?
            .into_iter()
            .filter(|wf| wf.updated_at <= cutoff)
            .collect();
        stale.sort_by_key(|wf| wf.updated_at);

        let mut report = SweepReport {
            stale: stale.len(),
            ..SweepReport::default()
        };
        for workflow in stale.into_iter().take(self.config.batch_limit) {
            match self.controller.redrive(workflow.id).await {
                Ok(RedriveOutcome::Redriven { .. }) => report.redriven.push(workflow.id),
                Ok(RedriveOutcome::Failed) => report.failed.push(workflow.id),
                Ok(RedriveOutcome::Locked) => report.locked.push(workflow.id),
                Ok(RedriveOutcome::Terminal | RedriveOutcome::Raced) => {
                    debug!(workflow_id = %workflow.id, "Workflow moved before it was re-driven");
                }
                Err(e) => {
                    warn!(workflow_id = %workflow.id, error = %e, "Re-drive failed");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Sweeps every `interval` until `shutdown` turns true.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let every = interval.max(Duration::from_millis(1));
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
            match self.sweep_once().await {
                Ok(report) if !report.is_empty() => info!(
                    stale = report.stale,
                    redriven = report.redriven.len(),
                    failed = report.failed.len(),
                    locked = report.locked.len(),
                    "Stuck workflows swept"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Sweep failed"),
            }
        }
        debug!("Sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionMode, StartRequest, Workflow};
    use crate::pipeline::{FnExecutor, StageGraph, StageInput, StageOutcome, StageRegistry};
    use crate::store::MemoryKvStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn controller() -> Arc<PipelineController> {
        let graph = StageGraph::builder("sweep").simple("a", 1).simple("b", 1).build().unwrap();
        let registry = StageRegistry::builder()
            .register("a", Arc::new(FnExecutor::new("a", |_: StageInput| async { Ok(StageOutcome::ok_value(json!({"x": 1}))) })))
            .unwrap()
            .register("b", Arc::new(FnExecutor::new("b", |_: StageInput| async { Ok(StageOutcome::ok_value(json!({"y": 2}))) })))
            .unwrap()
            .build(&graph)
            .unwrap();
        Arc::new(
            PipelineController::builder(Arc::new(MemoryKvStore::new()))
                .with_graph(graph)
                .with_registry(registry)
                .build()
                .unwrap(),
        )
    }

    fn fast_config() -> SweeperConfig {
        SweeperConfig {
            stale_after_seconds: 0.01,
            interval_seconds: 0.01,
            ..SweeperConfig::default()
        }
    }

    /// A RUNNING workflow whose worker died without releasing anything.
    async fn orphan(controller: &PipelineController, entity: &str, redrives: u32) -> Workflow {
        let mut wf = Workflow::new(&StartRequest::new(entity, "f", "m"), ExecutionMode::Direct)
            .begin("a")
            .unwrap();
        wf.redrive_count = redrives;
        controller.workflows().insert(&wf).await.unwrap();
        wf
    }

    async fn wait_for_status(controller: &PipelineController, id: Uuid, status: WorkflowStatus) {
        for _ in 0..200 {
            if controller.get_workflow(id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workflow {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_fresh_workflows_are_left_alone() {
        let controller = controller();
        orphan(&controller, "e", 0).await;
        let report = StuckWorkflowSweeper::new(controller).sweep_once().await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_orphan_is_redriven_to_completion() {
        let controller = controller();
        let wf = orphan(&controller, "e", 0).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let sweeper = StuckWorkflowSweeper::new(controller.clone()).with_config(fast_config());
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.redriven, vec![wf.id]);

        wait_for_status(&controller, wf.id, WorkflowStatus::Completed).await;
        let done = controller.get_workflow(wf.id).await.unwrap();
        assert_eq!(done.redrive_count, 1);
        assert_eq!(controller.accumulated_data(wf.id).await.unwrap().get("y"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_locked_entity_is_skipped() {
        let controller = controller();
        let wf = orphan(&controller, "e", 0).await;
        controller.locks().acquire("e", Duration::from_secs(30)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let report = StuckWorkflowSweeper::new(controller.clone())
            .with_config(fast_config())
            .sweep_once()
            .await
            .unwrap();
        assert_eq!(report.locked, vec![wf.id]);
        assert!(report.redriven.is_empty());
    }

    #[tokio::test]
    async fn test_running_stage_is_not_redriven() {
        let runs = Arc::new(AtomicUsize::new(0));
        let graph = StageGraph::builder("slow").simple("a", 1).build().unwrap();
        let counter = runs.clone();
        let slow = FnExecutor::new("a", move |_: StageInput| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(StageOutcome::ok_value(json!({"x": 1})))
            }
        });
        let registry = StageRegistry::builder().register("a", Arc::new(slow)).unwrap().build(&graph).unwrap();
        let controller = Arc::new(
            PipelineController::builder(Arc::new(MemoryKvStore::new()))
                .with_graph(graph)
                .with_registry(registry)
                .build()
                .unwrap(),
        );

        let running = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .start(StartRequest::new("e", "f", "m"), ExecutionMode::Direct)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = StuckWorkflowSweeper::new(controller.clone())
            .with_config(fast_config())
            .sweep_once()
            .await
            .unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(report.locked.len(), 1);
        assert!(report.redriven.is_empty());

        let outcome = running.await.unwrap().unwrap();
        let done = outcome.workflow().unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.redrive_count, 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_redrive_limit_fails_workflow() {
        let controller = controller();
        let wf = orphan(&controller, "e", 3).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let report = StuckWorkflowSweeper::new(controller.clone())
            .with_config(fast_config())
            .sweep_once()
            .await
            .unwrap();
        assert_eq!(report.failed, vec![wf.id]);
        let failed = controller.get_workflow(wf.id).await.unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let controller = controller();
        let wf = orphan(&controller, "e", 0).await;
        let (tx, rx) = watch::channel(false);
        let sweeper = StuckWorkflowSweeper::new(controller.clone()).with_config(fast_config());
        let handle = tokio::spawn(sweeper.run(Duration::from_millis(10), rx));

        wait_for_status(&controller, wf.id, WorkflowStatus::Completed).await;
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
