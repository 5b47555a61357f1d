//! Test assertions for workflows and progress events.

use crate::core::{Workflow, WorkflowStatus};
use crate::progress::ProgressEvent;

/// Asserts that the workflow completed every stage.
pub fn assert_workflow_completed(workflow: &Workflow) {
    assert_eq!(
        workflow.status,
        WorkflowStatus::Completed,
        "Expected COMPLETED, got {} (error: {:?})",
        workflow.status,
        workflow.error_message
    );
    assert_eq!(workflow.progress_percent, 100, "Completed workflow must be at 100%");
    assert!(workflow.lock.is_none(), "Completed workflow still holds its lock");
}

/// Asserts that the workflow failed with a message containing `needle`.
pub fn assert_workflow_failed(workflow: &Workflow, needle: &str) {
    assert_eq!(workflow.status, WorkflowStatus::Failed, "Expected FAILED, got {}", workflow.status);
    let message = workflow.error_message.as_deref().unwrap_or_default();
    assert!(
        message.contains(needle),
        "Expected error message containing '{needle}', got '{message}'"
    );
}

/// Asserts that progress percentages never go down, per workflow.
pub fn assert_progress_monotonic(events: &[ProgressEvent]) {
    let mut last = std::collections::HashMap::new();
    for event in events {
        let previous = last.insert(event.workflow_id, event.percent).unwrap_or(0);
        assert!(
            event.percent >= previous,
            "Progress of {} went from {previous} to {} at '{}'",
            event.workflow_id,
            event.percent,
            event.message
        );
    }
}
