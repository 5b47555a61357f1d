//! An in-memory controller wired for tests.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::core::{ExecutionMode, StartRequest, Workflow};
use crate::errors::DocflowError;
use crate::pipeline::{PipelineController, StageExecutor, StageGraph, StageRegistry, StartOutcome};
use crate::progress::CollectingProgressSink;
use crate::queue::{MemoryBroker, QueueOptions, StageQueueDispatcher};
use crate::retry::{JitterStrategy, RetryPolicies, RetryPolicy};
use crate::store::{ConnectionPool, MemoryKvStore};

/// Configuration with millisecond backoffs and polling, for tests.
#[must_use]
pub fn fast_config() -> OrchestratorConfig {
    let fast = RetryPolicy::new()
        .with_base_delay_ms(1)
        .with_max_delay_ms(5)
        .with_jitter(JitterStrategy::None);
    OrchestratorConfig::default()
        .with_retry(RetryPolicies::new(fast.clone()))
        .with_transaction_retry(fast.clone())
        .with_reconnect(fast)
        .with_queue(
            QueueOptions::new()
                .with_poll_interval(Duration::from_millis(5))
                .with_stalled_interval(Duration::from_millis(50)),
        )
}

/// A controller over in-memory stores, collecting progress events.
#[derive(Debug)]
pub struct TestHarness {
    controller: Arc<PipelineController>,
    kv: Arc<MemoryKvStore>,
    events: Arc<CollectingProgressSink>,
    broker: Option<Arc<MemoryBroker>>,
}

impl TestHarness {
    /// Starts a builder for `graph`.
    #[must_use]
    pub fn builder(graph: StageGraph) -> TestHarnessBuilder {
        TestHarnessBuilder {
            graph,
            stages: Vec::new(),
            config: fast_config(),
            queued: false,
            workers: true,
        }
    }

    /// The controller.
    #[must_use]
    pub fn controller(&self) -> &Arc<PipelineController> {
        &self.controller
    }

    /// The backing store.
    #[must_use]
    pub fn kv(&self) -> &Arc<MemoryKvStore> {
        &self.kv
    }

    /// Progress events emitted so far.
    #[must_use]
    pub fn events(&self) -> &Arc<CollectingProgressSink> {
        &self.events
    }

    /// The broker, in queued harnesses.
    #[must_use]
    pub fn broker(&self) -> Option<&Arc<MemoryBroker>> {
        self.broker.as_ref()
    }

    /// Runs a workflow for `entity_id` in direct mode and returns it in its
    /// final state.
    pub async fn run_direct(&self, entity_id: &str) -> Result<Workflow, DocflowError> {
        let outcome = self
            .controller
            .start(request(entity_id), ExecutionMode::Direct)
            .await?;
        match outcome {
            StartOutcome::Started { workflow } => Ok(workflow),
            StartOutcome::Rejected { entity_id, .. } => {
                Err(DocflowError::Validation(format!("entity {entity_id} is locked")))
            }
        }
    }

    /// Starts a workflow for `entity_id` in `mode`.
    pub async fn start(&self, entity_id: &str, mode: ExecutionMode) -> Result<StartOutcome, DocflowError> {
        self.controller.start(request(entity_id), mode).await
    }

    /// Polls until the workflow is terminal or `timeout` passes.
    pub async fn wait_for_terminal(&self, workflow_id: Uuid, timeout: Duration) -> Result<Workflow, DocflowError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let workflow = self.controller.get_workflow(workflow_id).await?;
            if workflow.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(workflow);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stops queue workers.
    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
    }
}

fn request(entity_id: &str) -> StartRequest {
    StartRequest::new(entity_id, format!("memory://{entity_id}.pdf"), "merchant-test")
}

/// Builder for [`TestHarness`].
pub struct TestHarnessBuilder {
    graph: StageGraph,
    stages: Vec<(String, Arc<dyn StageExecutor>)>,
    config: OrchestratorConfig,
    queued: bool,
    workers: bool,
}

impl std::fmt::Debug for TestHarnessBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHarnessBuilder")
            .field("graph", &self.graph.name())
            .field("stages", &self.stages.len())
            .field("queued", &self.queued)
            .finish_non_exhaustive()
    }
}

impl TestHarnessBuilder {
    /// Registers the executor of `stage`.
    #[must_use]
    pub fn stage(mut self, stage: impl Into<String>, executor: Arc<dyn StageExecutor>) -> Self {
        self.stages.push((stage.into(), executor));
        self
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a memory broker and starts queue workers.
    #[must_use]
    pub fn queued(mut self) -> Self {
        self.queued = true;
        self
    }

    /// Leaves spawning queue workers to the test, through
    /// [`PipelineController::spawn_workers`].
    #[must_use]
    pub fn without_workers(mut self) -> Self {
        self.workers = false;
        self
    }

    /// Builds the harness. Queue workers are spawned, so queued harnesses
    /// must be built inside a runtime.
    pub fn build(self) -> Result<TestHarness, DocflowError> {
        let mut registry = StageRegistry::builder();
        for (stage, executor) in self.stages {
            registry = registry.register(stage, executor)?;
        }
        let registry = registry.build(&self.graph)?;

        let kv = Arc::new(MemoryKvStore::new());
        let events = Arc::new(CollectingProgressSink::new());
        let mut builder = PipelineController::builder(kv.clone())
            .with_graph(self.graph)
            .with_registry(registry)
            .with_progress(events.clone())
            .with_config(self.config.clone());

        let broker = if self.queued {
            let broker = Arc::new(MemoryBroker::new());
            let pool = ConnectionPool::ready_now("broker", self.config.broker_pool.clone());
            let dispatcher = StageQueueDispatcher::new(broker.clone(), pool)
                .with_defaults(self.config.queue.clone())
                .with_reconnect_policy(self.config.reconnect.clone());
            builder = builder.with_dispatcher(Arc::new(dispatcher));
            Some(broker)
        } else {
            None
        };

        let controller = Arc::new(builder.build()?);
        if broker.is_some() && self.workers {
            controller.spawn_workers()?;
        }
        Ok(TestHarness {
            controller,
            kv,
            events,
            broker,
        })
    }
}
