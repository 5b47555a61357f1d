//! Testing utilities for docflow pipelines.
//!
//! This module provides:
//! - Scripted and recording stage executors
//! - An in-memory harness around the pipeline controller
//! - Assertions over workflows and progress events

mod assertions;
mod executors;
mod harness;

pub use assertions::{assert_progress_monotonic, assert_workflow_completed, assert_workflow_failed};
pub use executors::{RecordedCall, RecordingExecutor, ScriptStep, ScriptedExecutor};
pub use harness::{fast_config, TestHarness, TestHarnessBuilder};
