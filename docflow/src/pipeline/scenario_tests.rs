//! End-to-end behaviour of the controller over in-memory stores.

use async_trait::async_trait;
use mockall::{mock, Sequence};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::core::{DocumentStage, ExecutionMode, StartRequest, WorkflowStatus};
use crate::errors::StageError;
use crate::lock::EntityLockManager;
use crate::progress::ProgressEventType;
use crate::queue::{MemoryBroker, StageQueueDispatcher};
use crate::retry::{JitterStrategy, RetryPolicies, RetryPolicy, UniqueKeyResolver};
use crate::store::{AccumulatedData, ConnectionPool, KvStore, MemoryKvStore, PoolOptions};
use crate::testing::{
    assert_progress_monotonic, assert_workflow_completed, assert_workflow_failed, fast_config,
    RecordingExecutor, ScriptStep, ScriptedExecutor, TestHarness,
};

mock! {
    Executor {}

    #[async_trait]
    impl StageExecutor for Executor {
        async fn execute(&self, input: StageInput) -> anyhow::Result<StageOutcome>;
    }
}

fn abc() -> StageGraph {
    StageGraph::builder("abc")
        .simple("a", 40)
        .simple("b", 30)
        .simple("c", 30)
        .build()
        .unwrap()
}

fn succeeding(payload: serde_json::Value) -> Arc<dyn StageExecutor> {
    Arc::new(ScriptedExecutor::succeeding("stage", payload))
}

/// A controller with a dispatcher but no workers, so tests deliver jobs by
/// hand.
fn manual(
    graph: StageGraph,
    stages: Vec<(&str, Arc<dyn StageExecutor>)>,
    config: crate::config::OrchestratorConfig,
) -> (Arc<PipelineController>, Arc<MemoryBroker>) {
    let mut registry = StageRegistry::builder();
    for (stage, executor) in stages {
        registry = registry.register(stage, executor).unwrap();
    }
    let registry = registry.build(&graph).unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let dispatcher = StageQueueDispatcher::new(broker.clone(), ConnectionPool::ready_now("broker", PoolOptions::new()));
    let controller = PipelineController::builder(Arc::new(MemoryKvStore::new()))
        .with_graph(graph)
        .with_registry(registry)
        .with_config(config)
        .with_dispatcher(Arc::new(dispatcher))
        .build()
        .unwrap();
    (Arc::new(controller), broker)
}

fn request(entity: &str) -> StartRequest {
    StartRequest::new(entity, format!("s3://uploads/{entity}.pdf"), "merchant-1")
}

async fn start_queued(controller: &PipelineController, entity: &str) -> uuid::Uuid {
    controller
        .start(request(entity), ExecutionMode::Queued)
        .await
        .unwrap()
        .workflow()
        .unwrap()
        .id
}

#[tokio::test]
async fn test_scenario_a_direct_run_accumulates_all_payloads() {
    let harness = TestHarness::builder(abc())
        .stage("a", succeeding(json!({"x": 1})))
        .stage("b", succeeding(json!({"y": 2})))
        .stage("c", succeeding(json!({"z": 3})))
        .build()
        .unwrap();

    let workflow = harness.run_direct("invoice-a").await.unwrap();
    assert_workflow_completed(&workflow);
    assert_eq!(workflow.completed_stages, vec!["a", "b", "c"]);

    let data = harness.controller().accumulated_data(workflow.id).await.unwrap();
    assert_eq!(data.into_value(), json!({"x": 1, "y": 2, "z": 3}));
    assert_progress_monotonic(&harness.events().events());
    assert_eq!(harness.events().events_of_type(ProgressEventType::Completion).len(), 1);
}

#[tokio::test]
async fn test_scenario_a_queued_run_accumulates_all_payloads() {
    let harness = TestHarness::builder(abc())
        .stage("a", succeeding(json!({"x": 1})))
        .stage("b", succeeding(json!({"y": 2})))
        .stage("c", succeeding(json!({"z": 3})))
        .queued()
        .build()
        .unwrap();

    let outcome = harness.start("invoice-a", ExecutionMode::Queued).await.unwrap();
    let id = outcome.workflow().unwrap().id;
    let workflow = harness.wait_for_terminal(id, Duration::from_secs(5)).await.unwrap();

    assert_workflow_completed(&workflow);
    let data = harness.controller().accumulated_data(id).await.unwrap();
    assert_eq!(data.into_value(), json!({"x": 1, "y": 2, "z": 3}));
    assert!(harness.controller().locks().holder("invoice-a").await.unwrap().is_none());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_scenario_b_fatal_failure_keeps_earlier_results() {
    let c = Arc::new(ScriptedExecutor::succeeding("c", json!({"z": 3})));
    let harness = TestHarness::builder(abc())
        .stage("a", succeeding(json!({"x": 1})))
        .stage("b", Arc::new(ScriptedExecutor::failing("b", "invalid document")))
        .stage("c", c.clone())
        .build()
        .unwrap();

    let workflow = harness.run_direct("invoice-b").await.unwrap();
    assert_workflow_failed(&workflow, "invalid document");
    assert_eq!(workflow.completed_stages, vec!["a"]);
    assert!(workflow.lock.is_none());

    let data = harness.controller().accumulated_data(workflow.id).await.unwrap();
    assert_eq!(data.get("x"), Some(&json!(1)));
    assert!(harness.controller().locks().holder("invoice-b").await.unwrap().is_none());
    assert_eq!(harness.events().events_of_type(ProgressEventType::Error).len(), 1);
    assert_eq!(c.call_count(), 0);
}

#[tokio::test]
async fn test_scenario_c_transient_errors_then_success() {
    let mut mock = MockExecutor::new();
    let mut seq = Sequence::new();
    mock.expect_execute()
        .times(2)
        .in_sequence(&mut seq)
        .returning(|_| Err(StageError::transient("connection reset by peer").into()));
    mock.expect_execute()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|input| Ok(StageOutcome::ok_value(json!({"x": 1, "seen_attempt": input.attempt}))));

    let harness = TestHarness::builder(abc())
        .stage("a", Arc::new(mock))
        .stage("b", succeeding(json!({"y": 2})))
        .stage("c", succeeding(json!({"z": 3})))
        .build()
        .unwrap();

    let workflow = harness.run_direct("invoice-c").await.unwrap();
    assert_workflow_completed(&workflow);

    let results = harness.controller().results();
    let a = results.get_stage_result(workflow.id, "a").await.unwrap().unwrap();
    assert_eq!(a.attempts, 3);
    assert_eq!(a.payload.get("seen_attempt"), Some(&json!(3)));
    let stored_a = results
        .list_stage_results(workflow.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.stage == "a")
        .count();
    assert_eq!(stored_a, 1);
    assert_eq!(harness.events().events_of_type(ProgressEventType::Error).len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_d_concurrent_starts_admit_one() {
    let slow: Arc<dyn StageExecutor> = Arc::new(FnExecutor::new("slow", |_: StageInput| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(StageOutcome::ok_value(json!({"x": 1})))
    }));
    let harness = Arc::new(
        TestHarness::builder(abc())
            .stage("a", slow)
            .stage("b", succeeding(json!({"y": 2})))
            .stage("c", succeeding(json!({"z": 3})))
            .build()
            .unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let harness = harness.clone();
        handles.push(tokio::spawn(async move {
            harness.start("invoice-d", ExecutionMode::Direct).await.unwrap()
        }));
    }
    let mut started = Vec::new();
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            StartOutcome::Started { workflow } => started.push(workflow),
            StartOutcome::Rejected { entity_id, .. } => {
                assert_eq!(entity_id, "invoice-d");
                rejected += 1;
            }
        }
    }

    assert_eq!(started.len(), 1);
    assert_eq!(rejected, 7);
    assert_workflow_completed(&started[0]);
    let all = harness
        .controller()
        .workflows()
        .list_by_status(&[
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
        ])
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_scenario_d_queued_second_start_is_rejected() {
    let (controller, broker) = manual(
        abc(),
        vec![
            ("a", succeeding(json!({"x": 1}))),
            ("b", succeeding(json!({"y": 2}))),
            ("c", succeeding(json!({"z": 3}))),
        ],
        fast_config(),
    );
    let (first, second) = tokio::join!(
        controller.start(request("invoice-d"), ExecutionMode::Queued),
        controller.start(request("invoice-d"), ExecutionMode::Queued),
    );
    let outcomes = [first.unwrap(), second.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| o.is_rejected()).count(), 1);
    assert_eq!(broker.len(), 1);
}

#[tokio::test]
async fn test_current_stage_only_moves_forward() {
    let (controller, _broker) = manual(
        abc(),
        vec![
            ("a", succeeding(json!({"x": 1}))),
            ("b", succeeding(json!({"y": 2}))),
            ("c", succeeding(json!({"z": 3}))),
        ],
        fast_config(),
    );
    let id = start_queued(&controller, "invoice-m").await;
    let graph = controller.graph().clone();
    let mut last_position = 0;

    for stage in ["a", "b"] {
        let outcome = controller.run_stage(&StageJob::new(id, stage)).await.unwrap();
        assert!(matches!(outcome, StageRunOutcome::Advanced(AdvanceOutcome::Next { .. })));
        let current = controller.get_workflow(id).await.unwrap().current_stage.unwrap();
        let position = graph.position(&current).unwrap();
        assert!(position > last_position);
        last_position = position;
    }

    let stale = controller.run_stage(&StageJob::new(id, "a")).await.unwrap();
    assert_eq!(stale, StageRunOutcome::Skipped(NoopReason::AlreadyCompleted));
    let early = controller.advance(id, "a", serde_json::Map::new(), 1).await.unwrap();
    assert_eq!(early, AdvanceOutcome::Noop(NoopReason::AlreadyCompleted));
    assert_eq!(
        controller.get_workflow(id).await.unwrap().current_stage.as_deref(),
        Some("c")
    );
}

#[tokio::test]
async fn test_out_of_order_job_is_ignored() {
    let recorder = Arc::new(RecordingExecutor::succeeding(json!({"z": 3})));
    let (controller, _broker) = manual(
        abc(),
        vec![
            ("a", succeeding(json!({"x": 1}))),
            ("b", succeeding(json!({"y": 2}))),
            ("c", recorder.clone() as Arc<dyn StageExecutor>),
        ],
        fast_config(),
    );
    let id = start_queued(&controller, "invoice-o").await;

    let outcome = controller.run_stage(&StageJob::new(id, "c")).await.unwrap();
    assert_eq!(outcome, StageRunOutcome::Skipped(NoopReason::NotCurrent));
    assert_eq!(recorder.call_count(), 0);
    assert_eq!(controller.get_workflow(id).await.unwrap().current_stage.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_duplicate_delivery_advances_once() {
    let counter = Arc::new(AtomicU32::new(0));
    let calls = counter.clone();
    let counting: Arc<dyn StageExecutor> = Arc::new(FnExecutor::new("counting", move |_: StageInput| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok(StageOutcome::ok_value(json!({"n": n}))) }
    }));
    let (controller, _broker) = manual(
        abc(),
        vec![
            ("a", counting),
            ("b", succeeding(json!({"y": 2}))),
            ("c", succeeding(json!({"z": 3}))),
        ],
        fast_config(),
    );
    let id = start_queued(&controller, "invoice-i").await;
    let job = StageJob::new(id, "a");

    let (first, second) = tokio::join!(controller.run_stage(&job), controller.run_stage(&job));
    let outcomes = [first.unwrap(), second.unwrap()];
    let advanced = outcomes
        .iter()
        .filter(|o| matches!(o, StageRunOutcome::Advanced(AdvanceOutcome::Next { .. })))
        .count();
    assert_eq!(advanced, 1);

    let workflow = controller.get_workflow(id).await.unwrap();
    assert_eq!(workflow.completed_stages, vec!["a"]);
    let stored = controller.results().list_stage_results(id).await.unwrap();
    assert_eq!(stored.len(), 1);

    let before = counter.load(Ordering::SeqCst);
    let replay = controller.run_stage(&job).await.unwrap();
    assert_eq!(replay, StageRunOutcome::Skipped(NoopReason::AlreadyCompleted));
    assert_eq!(counter.load(Ordering::SeqCst), before);
    assert_eq!(controller.results().list_stage_results(id).await.unwrap(), stored);
}

#[test]
fn test_merge_is_independent_of_arrival_order() {
    let payloads = [
        ("a".to_string(), json!({"x": 1, "shared": "a"})),
        ("b".to_string(), json!({"y": 2})),
        ("c".to_string(), json!({"z": 3, "shared": "c"})),
    ];
    let order = ["a", "b", "c"];
    let permutations = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

    let merged: Vec<_> = permutations
        .iter()
        .map(|perm| {
            // Stage results come back sorted by pipeline position.
            let mut arrived: Vec<_> = perm.iter().map(|&i| payloads[i].clone()).collect();
            arrived.sort_by_key(|(stage, _)| order.iter().position(|s| *s == stage.as_str()));
            AccumulatedData::from_stages(
                arrived
                    .into_iter()
                    .map(|(stage, value)| (stage, value.as_object().cloned().unwrap_or_default()))
                    .collect(),
            )
            .into_value()
        })
        .collect();

    for value in &merged {
        assert_eq!(value, &json!({"x": 1, "y": 2, "z": 3, "shared": "c"}));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_live_lock_holder() {
    let locks = EntityLockManager::new(Arc::new(MemoryKvStore::new()));
    let mut handles = Vec::new();
    for _ in 0..16 {
        let locks = locks.clone();
        handles.push(tokio::spawn(async move {
            locks.acquire("invoice-l", Duration::from_secs(30)).await.unwrap()
        }));
    }
    let mut holders = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            holders += 1;
        }
    }
    assert_eq!(holders, 1);
}

#[tokio::test]
async fn test_crashed_holder_lock_expires() {
    let config = fast_config().with_lock(Duration::from_millis(50), Duration::from_millis(20));
    let (controller, _broker) = manual(
        abc(),
        vec![
            ("a", succeeding(json!({"x": 1}))),
            ("b", succeeding(json!({"y": 2}))),
            ("c", succeeding(json!({"z": 3}))),
        ],
        config,
    );
    let id = start_queued(&controller, "invoice-t").await;
    let original = controller.get_workflow(id).await.unwrap().lock.unwrap();

    // Nobody runs the job; the lease lapses.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(controller.locks().holder("invoice-t").await.unwrap().is_none());

    let outcome = controller.run_stage(&StageJob::new(id, "a")).await.unwrap();
    assert!(matches!(outcome, StageRunOutcome::Advanced(AdvanceOutcome::Next { .. })));
    let relocked = controller.get_workflow(id).await.unwrap().lock.unwrap();
    assert_ne!(relocked.token, original.token);
}

#[tokio::test]
async fn test_foreign_holder_blocks_stage() {
    let config = fast_config().with_lock(Duration::from_millis(50), Duration::from_millis(20));
    let (controller, _broker) = manual(
        abc(),
        vec![
            ("a", succeeding(json!({"x": 1}))),
            ("b", succeeding(json!({"y": 2}))),
            ("c", succeeding(json!({"z": 3}))),
        ],
        config,
    );
    let id = start_queued(&controller, "invoice-f").await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    controller
        .locks()
        .acquire("invoice-f", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let outcome = controller.run_stage(&StageJob::new(id, "a")).await.unwrap();
    assert_eq!(outcome, StageRunOutcome::Skipped(NoopReason::LockHeld));
    assert!(controller.get_workflow(id).await.unwrap().completed_stages.is_empty());
}

#[tokio::test]
async fn test_exhausted_retries_fail_exactly_once() {
    let flaky = Arc::new(ScriptedExecutor::new("a").otherwise(ScriptStep::TransientError("timeout".into())));
    let config = fast_config().with_retry(RetryPolicies::new(
        RetryPolicy::new()
            .with_max_attempts(3)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None),
    ));
    let harness = TestHarness::builder(abc())
        .stage("a", flaky.clone())
        .stage("b", succeeding(json!({"y": 2})))
        .stage("c", succeeding(json!({"z": 3})))
        .with_config(config)
        .build()
        .unwrap();

    let workflow = harness.run_direct("invoice-r").await.unwrap();
    assert_workflow_failed(&workflow, "after 3 attempts");
    assert_eq!(flaky.call_count(), 3);
    assert_eq!(harness.events().events_of_type(ProgressEventType::Error).len(), 1);
    assert_eq!(harness.events().events_of_type(ProgressEventType::Progress).len(), 2);

    let again = harness.controller().fail_workflow(workflow.id, None, "late").await.unwrap();
    assert!(!again);
    assert_eq!(harness.events().events_of_type(ProgressEventType::Error).len(), 1);
}

#[tokio::test]
async fn test_racing_failures_record_one() {
    let (controller, _broker) = manual(
        abc(),
        vec![
            ("a", succeeding(json!({"x": 1}))),
            ("b", succeeding(json!({"y": 2}))),
            ("c", succeeding(json!({"z": 3}))),
        ],
        fast_config(),
    );
    let id = start_queued(&controller, "invoice-x").await;
    let (first, second) = tokio::join!(
        controller.fail_workflow(id, Some("a"), "first"),
        controller.fail_workflow(id, Some("a"), "second"),
    );
    let wins = [first.unwrap(), second.unwrap()].iter().filter(|w| **w).count();
    assert_eq!(wins, 1);
    assert_eq!(controller.get_workflow(id).await.unwrap().status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_unique_keys_resolve_with_bounded_fallback() {
    let claims = Arc::new(MemoryKvStore::new());
    let registry = claims.clone();
    let persist: Arc<dyn StageExecutor> = Arc::new(FnExecutor::new("persist", move |_: StageInput| {
        let claims = registry.clone();
        async move {
            let resolved = UniqueKeyResolver::new()
                .resolve("SKU-1", |candidate| {
                    let claims = claims.clone();
                    async move { claims.set_if_absent(&format!("sku:{candidate}"), json!(true), None).await }
                })
                .await?;
            Ok(StageOutcome::ok_value(json!({"sku": resolved.key, "fallback": resolved.fallback})))
        }
    }));
    let graph = StageGraph::builder("keys").simple("persist", 1).build().unwrap();
    let harness = TestHarness::builder(graph).stage("persist", persist).build().unwrap();

    let mut keys = std::collections::HashSet::new();
    let mut fallbacks = 0;
    for n in 0..12 {
        let workflow = harness.run_direct(&format!("invoice-{n}")).await.unwrap();
        assert_workflow_completed(&workflow);
        let data = harness.controller().accumulated_data(workflow.id).await.unwrap();
        keys.insert(data.get("sku").cloned().unwrap());
        if data.get("fallback") == Some(&json!(true)) {
            fallbacks += 1;
        }
    }
    assert_eq!(keys.len(), 12);
    assert_eq!(fallbacks, 2);
    assert!(keys.contains(&json!("SKU-1-10")));
}

#[tokio::test]
async fn test_document_pipeline_skips_enrichment_without_line_items() {
    let enrichment = Arc::new(RecordingExecutor::succeeding(json!({"images": []})));
    let build = |line_items: serde_json::Value, enrichment: Arc<RecordingExecutor>| {
        TestHarness::builder(StageGraph::document_pipeline())
            .stage(DocumentStage::Extraction.as_str(), succeeding(json!({"vendor": "acme"})))
            .stage(DocumentStage::Persistence.as_str(), succeeding(json!({"line_items": line_items})))
            .stage(DocumentStage::Enrichment.as_str(), enrichment)
            .stage(DocumentStage::ExternalSync.as_str(), succeeding(json!({"synced": true})))
            .stage(DocumentStage::Finalization.as_str(), succeeding(json!({"final": true})))
            .build()
            .unwrap()
    };

    let empty = build(json!([]), enrichment.clone());
    let workflow = empty.run_direct("invoice-s").await.unwrap();
    assert_workflow_completed(&workflow);
    assert!(!workflow.has_completed(DocumentStage::Enrichment.as_str()));
    assert_eq!(enrichment.call_count(), 0);

    let with_items = build(json!([{"sku": "A"}]), enrichment.clone());
    let workflow = with_items.run_direct("invoice-s").await.unwrap();
    assert_workflow_completed(&workflow);
    assert!(workflow.has_completed(DocumentStage::Enrichment.as_str()));
    assert_eq!(enrichment.call_count(), 1);
    let seen = &enrichment.calls()[0];
    assert_eq!(seen.data.get("vendor"), Some(&json!("acme")));
}

#[tokio::test]
async fn test_cancelled_workflow_trips_running_stage() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let entered = gate.clone();
    let waiting: Arc<dyn StageExecutor> = Arc::new(FnExecutor::new("wait", move |input: StageInput| {
        let entered = entered.clone();
        async move {
            entered.notify_one();
            input.cancellation.cancelled().await;
            input.check_cancelled()?;
            Ok(StageOutcome::ok_empty())
        }
    }));
    let (controller, _broker) = manual(
        abc(),
        vec![
            ("a", waiting),
            ("b", succeeding(json!({"y": 2}))),
            ("c", succeeding(json!({"z": 3}))),
        ],
        fast_config(),
    );
    let id = start_queued(&controller, "invoice-k").await;

    let runner = controller.clone();
    let running = tokio::spawn(async move { runner.run_stage(&StageJob::new(id, "a")).await });
    gate.notified().await;
    assert!(controller.cancel(id, "user request").await.unwrap());

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome, StageRunOutcome::Skipped(NoopReason::Terminal));
    let workflow = controller.get_workflow(id).await.unwrap();
    assert_workflow_failed(&workflow, "Cancelled: user request");
    assert!(controller.results().get_stage_result(id, "a").await.unwrap().is_none());
}

/// A direct-mode controller over `kv`, so stages can inject store faults.
fn over_store(
    kv: Arc<MemoryKvStore>,
    b: Arc<dyn StageExecutor>,
    config: crate::config::OrchestratorConfig,
) -> (PipelineController, Arc<crate::progress::CollectingProgressSink>) {
    let graph = abc();
    let registry = StageRegistry::builder()
        .register("a", succeeding(json!({"x": 1})))
        .unwrap()
        .register("b", b)
        .unwrap()
        .register("c", succeeding(json!({"z": 3})))
        .unwrap()
        .build(&graph)
        .unwrap();
    let events = Arc::new(crate::progress::CollectingProgressSink::new());
    let controller = PipelineController::builder(kv)
        .with_graph(graph)
        .with_registry(registry)
        .with_config(config)
        .with_progress(events.clone())
        .build()
        .unwrap();
    (controller, events)
}

fn three_attempts() -> crate::config::OrchestratorConfig {
    fast_config().with_retry(RetryPolicies::new(
        RetryPolicy::new()
            .with_max_attempts(3)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None),
    ))
}

#[tokio::test]
async fn test_store_fault_after_stage_is_retried_to_completion() {
    let kv = Arc::new(MemoryKvStore::new());
    let runs = Arc::new(AtomicU32::new(0));
    let (store, counter) = (kv.clone(), runs.clone());
    let flaky: Arc<dyn StageExecutor> = Arc::new(FnExecutor::new("b", move |_: StageInput| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            store.fail_next(1);
        }
        async { Ok(StageOutcome::ok_value(json!({"y": 2}))) }
    }));
    let (controller, events) = over_store(kv, flaky, three_attempts());

    let outcome = controller.start(request("invoice-s"), ExecutionMode::Direct).await.unwrap();
    let workflow = outcome.workflow().unwrap();

    assert_workflow_completed(workflow);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    let b = controller.results().get_stage_result(workflow.id, "b").await.unwrap().unwrap();
    assert_eq!(b.attempts, 2);
    assert!(controller.locks().holder("invoice-s").await.unwrap().is_none());
    assert!(events
        .events_of_type(ProgressEventType::Progress)
        .iter()
        .any(|e| e.message.contains("connection reset")));
    assert_eq!(events.events_of_type(ProgressEventType::Error).len(), 0);
}

#[tokio::test]
async fn test_persistent_store_fault_fails_workflow_once() {
    let kv = Arc::new(MemoryKvStore::new());
    let runs = Arc::new(AtomicU32::new(0));
    let (store, counter) = (kv.clone(), runs.clone());
    let doomed: Arc<dyn StageExecutor> = Arc::new(FnExecutor::new("b", move |_: StageInput| {
        counter.fetch_add(1, Ordering::SeqCst);
        store.fail_next(1);
        async { Ok(StageOutcome::ok_value(json!({"y": 2}))) }
    }));
    let (controller, events) = over_store(kv, doomed, three_attempts());

    let outcome = controller.start(request("invoice-p"), ExecutionMode::Direct).await.unwrap();
    let workflow = outcome.workflow().unwrap();

    assert_workflow_failed(workflow, "after 3 attempts");
    assert_workflow_failed(workflow, "connection reset");
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(workflow.completed_stages, vec!["a"]);
    assert!(workflow.lock.is_none());
    assert!(controller.locks().holder("invoice-p").await.unwrap().is_none());
    assert_eq!(events.events_of_type(ProgressEventType::Error).len(), 1);
    assert!(controller.results().get_stage_result(workflow.id, "b").await.unwrap().is_none());
}

#[tokio::test]
async fn test_queued_store_fault_on_delivery_recovers() {
    let harness = TestHarness::builder(abc())
        .stage("a", succeeding(json!({"x": 1})))
        .stage("b", succeeding(json!({"y": 2})))
        .stage("c", succeeding(json!({"z": 3})))
        .queued()
        .without_workers()
        .build()
        .unwrap();
    let outcome = harness.start("invoice-q", ExecutionMode::Queued).await.unwrap();
    let id = outcome.workflow().unwrap().id;

    harness.kv().fail_next(1);
    harness.controller().spawn_workers().unwrap();
    let workflow = harness.wait_for_terminal(id, Duration::from_secs(5)).await.unwrap();

    assert_workflow_completed(&workflow);
    assert!(harness.controller().locks().holder("invoice-q").await.unwrap().is_none());
    assert_eq!(harness.events().events_of_type(ProgressEventType::Error).len(), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_unreadable_stage_data_fails_workflow() {
    let kv = Arc::new(MemoryKvStore::new());
    let recorder = Arc::new(RecordingExecutor::succeeding(json!({"y": 2})));
    let (controller, events) = over_store(kv.clone(), recorder.clone(), three_attempts());
    let mut tokened = crate::core::Workflow::new(&request("invoice-u"), ExecutionMode::Direct);
    tokened.lock = controller.locks().acquire("invoice-u", Duration::from_secs(30)).await.unwrap();
    controller.workflows().insert(&tokened.begin("a").unwrap()).await.unwrap();

    let advanced = controller.run_stage(&StageJob::new(tokened.id, "a")).await.unwrap();
    assert!(matches!(advanced, StageRunOutcome::Advanced(AdvanceOutcome::Next { .. })));
    kv.set(&format!("docflow:result:{}:a", tokened.id), json!("garbage"), None)
        .await
        .unwrap();

    let outcome = controller.deliver(&StageJob::new(tokened.id, "b")).await.unwrap();
    assert!(matches!(outcome, StageRunOutcome::Failed { .. }));
    assert_eq!(recorder.call_count(), 0);
    let workflow = controller.get_workflow(tokened.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert!(controller.locks().holder("invoice-u").await.unwrap().is_none());
    assert_eq!(events.events_of_type(ProgressEventType::Error).len(), 1);
}
