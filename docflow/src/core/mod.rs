//! Core data model: workflow records, statuses, and stage names.

mod stage;
mod status;
mod workflow;

pub use stage::DocumentStage;
pub use status::{ExecutionMode, WorkflowStatus};
pub use workflow::{StartRequest, Workflow};
