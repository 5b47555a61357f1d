//! Error types for the docflow orchestration engine.
//!
//! Every error knows which side of the retry taxonomy it falls on through
//! [`ErrorClass`]. Only the pipeline controller acts on that class; the
//! other components just report it.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Retry classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Transient infrastructure failure or contention; safe to retry.
    Retryable,
    /// Validation, domain, or configuration failure; never retried.
    Fatal,
}

impl ErrorClass {
    /// Returns true for [`ErrorClass::Retryable`].
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => write!(f, "RETRYABLE"),
            Self::Fatal => write!(f, "FATAL"),
        }
    }
}

/// The main error type for docflow operations.
#[derive(Debug, Error)]
pub enum DocflowError {
    /// Durable store failure.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Entity lock failure.
    #[error("{0}")]
    Lock(#[from] LockError),

    /// Job broker failure.
    #[error("{0}")]
    Broker(#[from] BrokerError),

    /// Connection pool failure.
    #[error("{0}")]
    Pool(#[from] PoolError),

    /// Invalid configuration.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// Invalid stage graph or registry.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// Typed failure raised by a stage executor.
    #[error("{0}")]
    Stage(#[from] StageError),

    /// The workflow record does not exist.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// A state machine transition was not allowed.
    #[error("Invalid transition for workflow {workflow_id}: {message}")]
    InvalidTransition {
        /// The workflow id.
        workflow_id: Uuid,
        /// What was attempted.
        message: String,
    },

    /// Input rejected before any work started.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Cooperative cancellation was observed.
    #[error("Workflow cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DocflowError {
    /// Creates an invalid transition error.
    #[must_use]
    pub fn invalid_transition(workflow_id: Uuid, message: impl Into<String>) -> Self {
        Self::InvalidTransition {
            workflow_id,
            message: message.into(),
        }
    }

    /// Returns the retry class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Store(e) => e.class(),
            Self::Lock(e) => e.class(),
            Self::Broker(e) => e.class(),
            Self::Pool(e) => e.class(),
            Self::Stage(e) => e.class(),
            Self::Config(_)
            | Self::Graph(_)
            | Self::WorkflowNotFound(_)
            | Self::InvalidTransition { .. }
            | Self::Validation(_)
            | Self::Cancelled(_)
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Returns true if this is an optimistic write conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(StoreError::Conflict { .. }))
    }
}

impl From<serde_json::Error> for DocflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised by the durable key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// An asserted precondition did not hold at commit time.
    #[error("Write conflict on key '{key}'")]
    Conflict {
        /// The key whose value changed underneath the writer.
        key: String,
    },

    /// A transaction did not commit within its time budget.
    #[error("Transaction '{label}' exceeded its {budget_ms}ms budget")]
    TransactionTimeout {
        /// Transaction label.
        label: String,
        /// The budget in milliseconds.
        budget_ms: u64,
    },

    /// A stored value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Filesystem error from a file-backed store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection pool refused the operation.
    #[error("{0}")]
    Pool(#[from] PoolError),
}

impl StoreError {
    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }

    /// Returns the retry class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable(_) | Self::Conflict { .. } | Self::TransactionTimeout { .. } | Self::Io(_) => {
                ErrorClass::Retryable
            }
            Self::Pool(e) => e.class(),
            Self::Serialization(_) => ErrorClass::Fatal,
        }
    }

    /// Returns true if this is an optimistic write conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised by the entity lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder owns the entity.
    #[error("Entity '{entity_id}' is locked by another holder")]
    Held {
        /// The entity id.
        entity_id: String,
    },

    /// The caller's lock expired or was taken over.
    #[error("Lock on entity '{entity_id}' was lost")]
    Lost {
        /// The entity id.
        entity_id: String,
    },

    /// The underlying store failed.
    #[error("{0}")]
    Store(#[from] StoreError),
}

impl LockError {
    /// Returns the retry class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Held { .. } => ErrorClass::Retryable,
            Self::Lost { .. } => ErrorClass::Fatal,
            Self::Store(e) => e.class(),
        }
    }
}

/// Errors raised by the job broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker connection dropped.
    #[error("Broker disconnected: {0}")]
    Disconnected(String),

    /// The queue was never declared.
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// The job payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The broker connection pool refused the operation.
    #[error("{0}")]
    Pool(#[from] PoolError),
}

impl BrokerError {
    /// Returns the retry class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Disconnected(_) => ErrorClass::Retryable,
            Self::Pool(e) => e.class(),
            Self::UnknownQueue(_) | Self::Serialization(_) => ErrorClass::Fatal,
        }
    }
}

/// Errors raised by a connection pool.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// The pool has not finished warming up.
    #[error("Connection pool '{pool}' is not ready")]
    NotReady {
        /// Pool name.
        pool: String,
    },

    /// No connection became free before the acquire timeout.
    #[error("Connection pool '{pool}' exhausted after waiting {waited_ms}ms")]
    Exhausted {
        /// Pool name.
        pool: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// Warmup probe failed permanently.
    #[error("Connection pool '{pool}' failed to warm up: {message}")]
    WarmupFailed {
        /// Pool name.
        pool: String,
        /// Last probe error.
        message: String,
    },

    /// The pool was closed.
    #[error("Connection pool '{pool}' is closed")]
    Closed {
        /// Pool name.
        pool: String,
    },
}

impl PoolError {
    /// Returns the retry class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotReady { .. } | Self::Exhausted { .. } => ErrorClass::Retryable,
            Self::WarmupFailed { .. } | Self::Closed { .. } => ErrorClass::Fatal,
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds an unusable value.
    #[error("Invalid configuration for '{field}': {message}")]
    Invalid {
        /// Dotted field path.
        field: String,
        /// Why it was rejected.
        message: String,
    },

    /// The configuration document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// The configuration file could not be read.
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The tracing subscriber could not be installed.
    #[error("Failed to initialise logging: {0}")]
    Logging(String),
}

impl ConfigError {
    /// Creates an invalid field error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while building the stage graph or handler registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The graph has no stages.
    #[error("Stage graph '{0}' has no stages")]
    Empty(String),

    /// A stage name appears twice.
    #[error("Duplicate stage: {0}")]
    DuplicateStage(String),

    /// A stage name is not part of the graph.
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// A graph stage has no registered handler.
    #[error("No handler registered for stage '{0}'")]
    MissingHandler(String),

    /// A handler was registered for a stage the graph does not contain.
    #[error("Handler registered for unknown stage '{0}'")]
    UnknownHandler(String),
}

/// A typed failure returned by a stage executor.
///
/// Executors may return any error through `anyhow`; wrapping it in a
/// `StageError` states the retry class explicitly instead of leaving it to
/// message heuristics.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StageError {
    /// Human-readable reason.
    pub message: String,
    /// Whether the failure is transient.
    pub retryable: bool,
}

impl StageError {
    /// Creates a fatal stage error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a transient stage error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Returns the retry class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        if self.retryable {
            ErrorClass::Retryable
        } else {
            ErrorClass::Fatal
        }
    }
}
