//! Persisted workflow records with optimistic updates.

use std::sync::Arc;
use uuid::Uuid;

use super::kv::{KvOp, KvStore};
use crate::core::{Workflow, WorkflowStatus};
use crate::errors::StoreError;

/// Stores workflows under `{namespace}:workflow:{id}`.
#[derive(Clone)]
pub struct WorkflowRepository {
    kv: Arc<dyn KvStore>,
    namespace: String,
}

impl std::fmt::Debug for WorkflowRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRepository")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl WorkflowRepository {
    /// Creates a repository in the `docflow` namespace.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            namespace: "docflow".to_string(),
        }
    }

    /// Sets the key namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn prefix(&self) -> String {
        format!("{}:workflow:", self.namespace)
    }

    /// The key of a workflow record.
    #[must_use]
    pub fn key(&self, id: Uuid) -> String {
        format!("{}{id}", self.prefix())
    }

    /// Stores a new workflow. Fails with a conflict if the id exists.
    pub async fn insert(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let key = self.key(workflow.id);
        if self.kv.set_if_absent(&key, serde_json::to_value(workflow)?, None).await? {
            Ok(())
        } else {
            Err(StoreError::conflict(key))
        }
    }

    /// Loads a workflow.
    pub async fn get(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        self.kv
            .get(&self.key(id))
            .await?
            .map(|value| serde_json::from_value(value).map_err(StoreError::from))
            .transpose()
    }

    /// Writes that replace `before` with `after`, guarded by an assert that
    /// the stored record still equals `before`.
    pub fn prepare_update(&self, before: &Workflow, after: &Workflow) -> Result<Vec<KvOp>, StoreError> {
        let key = self.key(before.id);
        Ok(vec![
            KvOp::assert(key.clone(), Some(serde_json::to_value(before)?)),
            KvOp::put(key, serde_json::to_value(after)?),
        ])
    }

    /// Replaces `before` with `after` if nobody changed it in between.
    pub async fn update(&self, before: &Workflow, after: &Workflow) -> Result<(), StoreError> {
        self.kv.apply(self.prepare_update(before, after)?).await
    }

    /// Workflows whose status is one of `statuses`.
    pub async fn list_by_status(&self, statuses: &[WorkflowStatus]) -> Result<Vec<Workflow>, StoreError> {
        let mut found = Vec::new();
        for (_, value) in self.kv.scan_prefix(&self.prefix()).await? {
            let workflow: Workflow = serde_json::from_value(value)?;
            if statuses.contains(&workflow.status) {
                found.push(workflow);
            }
        }
        Ok(found)
    }
}
