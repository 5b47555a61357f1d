//! The persisted workflow record and its state transitions.
//!
//! Transitions return a new record instead of mutating in place so the
//! controller can assert the previous version inside the commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::{ExecutionMode, WorkflowStatus};
use crate::errors::DocflowError;
use crate::lock::LockToken;

/// Request to start processing one uploaded document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Business record the document belongs to; the unit of mutual exclusion.
    pub entity_id: String,
    /// Reference to the uploaded file.
    pub file_ref: String,
    /// Owning tenant.
    pub merchant_id: String,
}

impl StartRequest {
    /// Creates a new start request.
    #[must_use]
    pub fn new(
        entity_id: impl Into<String>,
        file_ref: impl Into<String>,
        merchant_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            file_ref: file_ref.into(),
            merchant_id: merchant_id.into(),
        }
    }

    /// Rejects requests with blank identifiers.
    pub fn validate(&self) -> Result<(), DocflowError> {
        for (field, value) in [
            ("entity_id", &self.entity_id),
            ("file_ref", &self.file_ref),
            ("merchant_id", &self.merchant_id),
        ] {
            if value.trim().is_empty() {
                return Err(DocflowError::Validation(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }
}

/// One end-to-end run of the pipeline for one uploaded document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Time-ordered workflow id.
    pub id: Uuid,
    /// Business record id.
    pub entity_id: String,
    /// Owning tenant.
    pub merchant_id: String,
    /// Uploaded file reference.
    pub file_ref: String,
    /// Stage being executed, `None` before start and after completion.
    pub current_stage: Option<String>,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Weighted progress, 0 to 100.
    pub progress_percent: u8,
    /// Stages finished so far, in order.
    pub completed_stages: Vec<String>,
    /// Human-readable reason for FAILED.
    pub error_message: Option<String>,
    /// Runner selected at start.
    pub execution_mode: ExecutionMode,
    /// Entity lock held on behalf of this workflow.
    pub lock: Option<LockToken>,
    /// Times the sweeper re-drove this workflow.
    #[serde(default)]
    pub redrive_count: u32,
    /// Incremented on every persisted change.
    #[serde(default)]
    pub revision: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last persisted change.
    pub updated_at: DateTime<Utc>,
    /// Time the workflow reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Creates a PENDING workflow for the request.
    #[must_use]
    pub fn new(request: &StartRequest, mode: ExecutionMode) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            entity_id: request.entity_id.clone(),
            merchant_id: request.merchant_id.clone(),
            file_ref: request.file_ref.clone(),
            current_stage: None,
            status: WorkflowStatus::Pending,
            progress_percent: 0,
            completed_stages: Vec::new(),
            error_message: None,
            execution_mode: mode,
            lock: None,
            redrive_count: 0,
            revision: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Returns true once COMPLETED or FAILED.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if `stage` already finished.
    #[must_use]
    pub fn has_completed(&self, stage: &str) -> bool {
        self.completed_stages.iter().any(|s| s == stage)
    }

    /// Returns true if `stage` is the stage currently scheduled.
    #[must_use]
    pub fn is_current(&self, stage: &str) -> bool {
        self.current_stage.as_deref() == Some(stage)
    }

    /// PENDING to RUNNING on the first stage.
    pub fn begin(&self, first_stage: &str) -> Result<Self, DocflowError> {
        if self.status != WorkflowStatus::Pending {
            return Err(DocflowError::invalid_transition(
                self.id,
                format!("cannot start from {}", self.status),
            ));
        }
        let mut next = self.touched();
        next.status = WorkflowStatus::Running;
        next.current_stage = Some(first_stage.to_string());
        Ok(next)
    }

    /// Records `stage` as done and moves to `next_stage`, or to COMPLETED
    /// when there is none.
    pub fn complete_stage(
        &self,
        stage: &str,
        next_stage: Option<&str>,
        progress_percent: u8,
    ) -> Result<Self, DocflowError> {
        if self.status != WorkflowStatus::Running {
            return Err(DocflowError::invalid_transition(
                self.id,
                format!("cannot complete stage '{stage}' while {}", self.status),
            ));
        }
        if !self.is_current(stage) || self.has_completed(stage) {
            return Err(DocflowError::invalid_transition(
                self.id,
                format!(
                    "stage '{stage}' is not current (current: {})",
                    self.current_stage.as_deref().unwrap_or("none")
                ),
            ));
        }

        let mut next = self.touched();
        next.completed_stages.push(stage.to_string());
        next.progress_percent = progress_percent.min(100).max(self.progress_percent);
        match next_stage {
            Some(name) => next.current_stage = Some(name.to_string()),
            None => {
                next.current_stage = None;
                next.status = WorkflowStatus::Completed;
                next.progress_percent = 100;
                next.completed_at = Some(next.updated_at);
            }
        }
        Ok(next)
    }

    /// Moves a non-terminal workflow to FAILED.
    pub fn fail(&self, message: impl Into<String>) -> Result<Self, DocflowError> {
        if self.is_terminal() {
            return Err(DocflowError::invalid_transition(
                self.id,
                format!("cannot fail a {} workflow", self.status),
            ));
        }
        let mut next = self.touched();
        next.status = WorkflowStatus::Failed;
        next.error_message = Some(message.into());
        next.completed_at = Some(next.updated_at);
        Ok(next)
    }

    /// Returns a copy holding a different entity lock.
    #[must_use]
    pub fn with_lock(&self, lock: Option<LockToken>) -> Self {
        let mut next = self.touched();
        next.lock = lock;
        next
    }

    /// Returns a copy with the re-drive counter bumped.
    #[must_use]
    pub fn redriven(&self) -> Self {
        let mut next = self.touched();
        next.redrive_count += 1;
        next
    }

    /// Returns a copy stamped as changed now, with nothing else changed.
    #[must_use]
    pub fn touched(&self) -> Self {
        let mut next = self.clone();
        next.revision += 1;
        next.updated_at = Utc::now();
        next
    }
}
