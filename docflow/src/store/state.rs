//! Durable per-stage results of each workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::kv::{KvOp, KvStore};
use super::merge::AccumulatedData;
use crate::errors::StoreError;

/// The output of one stage of one workflow. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Owning workflow.
    pub workflow_id: Uuid,
    /// Stage name.
    pub stage: String,
    /// Stage output.
    pub payload: Map<String, Value>,
    /// Attempt that produced the output.
    pub attempts: u32,
    /// Hash of the canonical payload.
    pub payload_hash: String,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
}

impl StageResult {
    /// Creates a result and hashes its payload.
    #[must_use]
    pub fn new(workflow_id: Uuid, stage: impl Into<String>, payload: Map<String, Value>, attempts: u32) -> Self {
        Self {
            workflow_id,
            stage: stage.into(),
            payload_hash: payload_hash(&payload),
            payload,
            attempts,
            completed_at: Utc::now(),
        }
    }

    /// Returns true if `other` carries the same payload.
    #[must_use]
    pub fn same_payload(&self, other: &Self) -> bool {
        self.payload_hash == other.payload_hash
    }
}

/// SHA-256 hex digest of the payload's canonical JSON (keys sorted).
#[must_use]
pub fn payload_hash(payload: &Map<String, Value>) -> String {
    let canonical = serde_json::to_string(payload).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Result of saving a stage result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// First write for this stage.
    Inserted,
    /// An identical result already existed.
    Unchanged,
    /// A different result already existed and was kept.
    Conflicting {
        /// Hash of the stored payload.
        existing_hash: String,
    },
}

/// Stores stage results under `{namespace}:result:{workflow}:{stage}`.
#[derive(Clone)]
pub struct WorkflowStateStore {
    kv: Arc<dyn KvStore>,
    namespace: String,
    stage_order: Vec<String>,
}

impl std::fmt::Debug for WorkflowStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStateStore")
            .field("namespace", &self.namespace)
            .field("stage_order", &self.stage_order)
            .finish_non_exhaustive()
    }
}

impl WorkflowStateStore {
    /// Creates a store in the `docflow` namespace.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            namespace: "docflow".to_string(),
            stage_order: Vec::new(),
        }
    }

    /// Sets the key namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the pipeline order used to merge results. Stages missing from
    /// the order merge last, by completion time.
    #[must_use]
    pub fn with_stage_order(mut self, order: Vec<String>) -> Self {
        self.stage_order = order;
        self
    }

    fn prefix(&self, workflow_id: Uuid) -> String {
        format!("{}:result:{workflow_id}:", self.namespace)
    }

    fn key(&self, workflow_id: Uuid, stage: &str) -> String {
        format!("{}{stage}", self.prefix(workflow_id))
    }

    /// Saves `payload` as the result of `stage` on its first attempt.
    pub async fn save_stage_result(
        &self,
        workflow_id: Uuid,
        stage: &str,
        payload: Map<String, Value>,
    ) -> Result<SaveOutcome, StoreError> {
        self.save(&StageResult::new(workflow_id, stage, payload, 1)).await
    }

    /// Saves `result` unless one already exists. An existing result is
    /// never overwritten.
    pub async fn save(&self, result: &StageResult) -> Result<SaveOutcome, StoreError> {
        let key = self.key(result.workflow_id, &result.stage);
        if self.kv.set_if_absent(&key, serde_json::to_value(result)?, None).await? {
            debug!(workflow_id = %result.workflow_id, stage = %result.stage, "Stage result saved");
            return Ok(SaveOutcome::Inserted);
        }

        let existing = self
            .get_stage_result(result.workflow_id, &result.stage)
            .await?
            .ok_or_else(|| StoreError::conflict(key.clone()))?;
        if existing.same_payload(result) {
            Ok(SaveOutcome::Unchanged)
        } else {
            warn!(
                workflow_id = %result.workflow_id,
                stage = %result.stage,
                "Differing stage result re-delivered, keeping the first"
            );
            Ok(SaveOutcome::Conflicting {
                existing_hash: existing.payload_hash,
            })
        }
    }

    /// The write that stores `result`, for use inside a transaction that
    /// also asserts the workflow record.
    pub fn prepare_save(&self, result: &StageResult) -> Result<KvOp, StoreError> {
        Ok(KvOp::put(
            self.key(result.workflow_id, &result.stage),
            serde_json::to_value(result)?,
        ))
    }

    /// Returns the stored result of `stage`.
    pub async fn get_stage_result(
        &self,
        workflow_id: Uuid,
        stage: &str,
    ) -> Result<Option<StageResult>, StoreError> {
        self.kv
            .get(&self.key(workflow_id, stage))
            .await?
            .map(|value| serde_json::from_value(value).map_err(StoreError::from))
            .transpose()
    }

    /// All stored results, in merge order.
    pub async fn list_stage_results(&self, workflow_id: Uuid) -> Result<Vec<StageResult>, StoreError> {
        let mut results = self
            .kv
            .scan_prefix(&self.prefix(workflow_id))
            .await?
            .into_iter()
            .map(|(_, value)| serde_json::from_value::<StageResult>(value).map_err(StoreError::from))
            .collect::<Result<Vec<_>, _>>()?;

        results.sort_by(|a, b| {
            self.order_of(&a.stage)
                .cmp(&self.order_of(&b.stage))
                .then(a.completed_at.cmp(&b.completed_at))
        });
        Ok(results)
    }

    /// Union of all stage results of the workflow.
    pub async fn get_accumulated_data(&self, workflow_id: Uuid) -> Result<AccumulatedData, StoreError> {
        let results = self.list_stage_results(workflow_id).await?;
        Ok(AccumulatedData::from_stages(
            results.into_iter().map(|r| (r.stage, r.payload)).collect(),
        ))
    }

    /// Deletes every result of the workflow. Returns how many were removed.
    pub async fn clear(&self, workflow_id: Uuid) -> Result<usize, StoreError> {
        let keys: Vec<String> = self
            .kv
            .scan_prefix(&self.prefix(workflow_id))
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let count = keys.len();
        if count > 0 {
            self.kv.apply(keys.into_iter().map(KvOp::delete).collect()).await?;
        }
        debug!(%workflow_id, count, "Cleared stage results");
        Ok(count)
    }

    fn order_of(&self, stage: &str) -> usize {
        self.stage_order
            .iter()
            .position(|s| s == stage)
            .unwrap_or(self.stage_order.len())
    }
}
