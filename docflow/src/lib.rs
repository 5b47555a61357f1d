//! # Docflow
//!
//! Durable workflow orchestration for staged document processing.
//!
//! Docflow drives an uploaded business document through a fixed sequence of
//! stages across crash-prone workers, with:
//!
//! - **Per-entity mutual exclusion**: one live workflow per business record
//! - **Idempotent stage results**: at-least-once delivery without double writes
//! - **Bounded transactions**: lookups first, then one time-budgeted commit
//! - **Retry and backoff**: transient failures retried, fatal ones recorded
//! - **Progress streaming**: best-effort events with an SSE heartbeat
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use docflow::prelude::*;
//!
//! let graph = StageGraph::document_pipeline();
//! let registry = StageRegistry::builder()
//!     .register("extraction", Arc::new(ExtractStage::new()))?
//!     // ... one executor per stage
//!     .build(&graph)?;
//!
//! let controller = PipelineController::builder(Arc::new(MemoryKvStore::new()))
//!     .with_graph(graph)
//!     .with_registry(registry)
//!     .build()?;
//!
//! let outcome = controller
//!     .start(StartRequest::new("invoice-42", "s3://uploads/42.pdf", "acme"), ExecutionMode::Direct)
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod lock;
pub mod observability;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationScope, CancellationToken};
    pub use crate::config::OrchestratorConfig;
    pub use crate::core::{DocumentStage, ExecutionMode, StartRequest, Workflow, WorkflowStatus};
    pub use crate::errors::{DocflowError, ErrorClass, StageError};
    pub use crate::lock::EntityLockManager;
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        FnExecutor, PipelineController, StageExecutor, StageGraph, StageInput, StageNode,
        StageOutcome, StageRegistry, StartOutcome, StuckWorkflowSweeper,
    };
    pub use crate::progress::{sse_frames, ProgressEvent, ProgressPublisher, ProgressSink, Topic};
    pub use crate::queue::{MemoryBroker, QueueOptions, StageQueueDispatcher};
    pub use crate::retry::{RetryLayer, RetryPolicy};
    pub use crate::store::{ConnectionPool, FileKvStore, KvStore, MemoryKvStore, PoolOptions};
}
