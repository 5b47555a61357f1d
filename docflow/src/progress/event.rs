//! Progress events and topics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::core::Workflow;

/// Kind of progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    /// A stage started.
    Stage,
    /// Progress moved, or a stage is being retried.
    Progress,
    /// The workflow completed.
    Completion,
    /// The workflow failed.
    Error,
}

impl ProgressEventType {
    /// Wire name of the event type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stage => "stage",
            Self::Progress => "progress",
            Self::Completion => "completion",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ProgressEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ephemeral progress notification. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Workflow the event belongs to.
    pub workflow_id: Uuid,
    /// Business record.
    pub entity_id: String,
    /// Owning tenant.
    pub merchant_id: String,
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,
    /// Stage the event refers to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Progress at the time of the event.
    pub percent: u8,
    /// Human-readable message.
    pub message: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    fn for_workflow(
        workflow: &Workflow,
        event_type: ProgressEventType,
        stage: Option<&str>,
        percent: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow.id,
            entity_id: workflow.entity_id.clone(),
            merchant_id: workflow.merchant_id.clone(),
            event_type,
            stage: stage.map(str::to_string),
            percent: percent.min(100),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// A stage started.
    #[must_use]
    pub fn stage(workflow: &Workflow, stage: &str) -> Self {
        Self::for_workflow(
            workflow,
            ProgressEventType::Stage,
            Some(stage),
            workflow.progress_percent,
            format!("Starting {stage}"),
        )
    }

    /// Progress moved.
    #[must_use]
    pub fn progress(workflow: &Workflow, stage: &str, message: impl Into<String>) -> Self {
        Self::for_workflow(
            workflow,
            ProgressEventType::Progress,
            Some(stage),
            workflow.progress_percent,
            message,
        )
    }

    /// The workflow completed.
    #[must_use]
    pub fn completion(workflow: &Workflow) -> Self {
        Self::for_workflow(workflow, ProgressEventType::Completion, None, 100, "Processing complete")
    }

    /// The workflow failed.
    #[must_use]
    pub fn error(workflow: &Workflow, stage: Option<&str>, message: impl Into<String>) -> Self {
        Self::for_workflow(
            workflow,
            ProgressEventType::Error,
            stage,
            workflow.progress_percent,
            message,
        )
    }

    /// Topics this event is published on.
    #[must_use]
    pub fn topics(&self) -> [Topic; 2] {
        [Topic::tenant(&self.merchant_id), Topic::entity(&self.entity_id)]
    }
}

/// A pub/sub topic, partitioned per tenant or per entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    /// All events of one tenant.
    #[must_use]
    pub fn tenant(merchant_id: &str) -> Self {
        Self(format!("tenant:{merchant_id}"))
    }

    /// All events of one entity.
    #[must_use]
    pub fn entity(entity_id: &str) -> Self {
        Self(format!("entity:{entity_id}"))
    }

    /// The topic name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
