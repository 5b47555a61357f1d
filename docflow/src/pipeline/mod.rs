//! Pipeline controller.
//!
//! - [`StageGraph`] orders stages, weights progress and computes skips
//! - [`StageRegistry`] maps stage names to [`StageExecutor`]s, frozen at startup
//! - [`PipelineController`] runs, advances and fails workflows
//! - [`QueuedRunner`] and [`DirectRunner`] decide where the next stage runs
//! - [`StuckWorkflowSweeper`] re-drives workflows that stopped moving

mod controller;
mod executor;
mod graph;
mod registry;
mod runner;
mod sweeper;

#[cfg(test)]
mod scenario_tests;

pub use controller::{
    AdvanceOutcome, NoopReason, PipelineController, PipelineControllerBuilder, RedriveOutcome,
    StageRunOutcome, StartOutcome,
};
pub use executor::{FnExecutor, StageExecutor, StageInput, StageOutcome};
pub use graph::{SkipPredicate, StageGraph, StageGraphBuilder, StageNode};
pub use registry::{StageRegistry, StageRegistryBuilder};
pub use runner::{ControllerJobHandler, DirectRunner, QueuedRunner, StageJob, StageRunner};
pub use sweeper::{StuckWorkflowSweeper, SweepReport};
