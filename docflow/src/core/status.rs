//! Status enums for workflows and execution modes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Created, first stage not yet started.
    #[default]
    Pending,
    /// A stage is scheduled or executing.
    Running,
    /// All stages finished successfully.
    Completed,
    /// Terminated by a fatal or exhausted failure.
    Failed,
}

impl WorkflowStatus {
    /// Returns true for COMPLETED and FAILED.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How stages of a workflow are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Each stage is a job on a per-stage queue.
    #[default]
    Queued,
    /// Stages run back to back in the caller's task.
    Direct,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "direct" => Ok(Self::Direct),
            other => Err(format!("unknown execution mode '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!WorkflowStatus::Pending.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&WorkflowStatus::Running).unwrap();
        assert_eq!(json, r#""RUNNING""#);
        let status: WorkflowStatus = serde_json::from_str(r#""FAILED""#).unwrap();
        assert_eq!(status, WorkflowStatus::Failed);
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!("Direct".parse::<ExecutionMode>().unwrap(), ExecutionMode::Direct);
        assert_eq!(ExecutionMode::Queued.to_string(), "queued");
        assert!("sideways".parse::<ExecutionMode>().is_err());
    }
}
