//! The stage executor contract.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use uuid::Uuid;

use crate::cancellation::CancellationScope;
use crate::core::Workflow;
use crate::errors::DocflowError;
use crate::store::AccumulatedData;

/// Everything a stage executor gets for one attempt.
#[derive(Debug, Clone)]
pub struct StageInput {
    /// Workflow id.
    pub workflow_id: Uuid,
    /// Business record id.
    pub entity_id: String,
    /// Owning tenant.
    pub merchant_id: String,
    /// Uploaded file reference.
    pub file_ref: String,
    /// Stage being executed.
    pub stage: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Results of the stages that ran before.
    pub data: AccumulatedData,
    /// Tripped when the workflow fails, is cancelled, or loses its lock.
    pub cancellation: CancellationScope,
}

impl StageInput {
    /// Builds the input for `stage` of `workflow`.
    #[must_use]
    pub fn new(
        workflow: &Workflow,
        stage: impl Into<String>,
        attempt: u32,
        data: AccumulatedData,
        cancellation: CancellationScope,
    ) -> Self {
        Self {
            workflow_id: workflow.id,
            entity_id: workflow.entity_id.clone(),
            merchant_id: workflow.merchant_id.clone(),
            file_ref: workflow.file_ref.clone(),
            stage: stage.into(),
            attempt,
            data,
            cancellation,
        }
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Fails with [`DocflowError::Cancelled`] once cancellation was
    /// requested. Call before expensive work.
    pub fn check_cancelled(&self) -> Result<(), DocflowError> {
        self.cancellation.check()
    }
}

/// What a stage attempt produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageOutcome {
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Output stored under the stage's namespace.
    pub payload: Map<String, Value>,
    /// Whether a failure may be retried.
    pub retryable: bool,
    /// Failure reason.
    pub error: Option<String>,
}

impl StageOutcome {
    /// A success with `payload`.
    #[must_use]
    pub fn ok(payload: Map<String, Value>) -> Self {
        Self {
            success: true,
            payload,
            ..Self::default()
        }
    }

    /// A success from any JSON value. Non-objects are stored under
    /// `"value"`.
    #[must_use]
    pub fn ok_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::ok(map),
            Value::Null => Self::ok_empty(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Self::ok(map)
            }
        }
    }

    /// A success without output.
    #[must_use]
    pub fn ok_empty() -> Self {
        Self::ok(Map::new())
    }

    /// A fatal failure.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// A transient failure.
    #[must_use]
    pub fn fail_retryable(error: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::fail(error)
        }
    }

    /// Adds one output field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Failure reason, or a placeholder.
    #[must_use]
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("stage failed without a reason")
    }
}

/// Runs one stage.
///
/// Returning `Err` is treated like a failed outcome whose retry class comes
/// from the error classifier.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Executes one attempt.
    async fn execute(&self, input: StageInput) -> anyhow::Result<StageOutcome>;
}

/// Adapts an async closure into a [`StageExecutor`].
pub struct FnExecutor<F> {
    name: String,
    func: F,
}

impl<F> FnExecutor<F> {
    /// Wraps `func`.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> fmt::Debug for FnExecutor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnExecutor").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> StageExecutor for FnExecutor<F>
where
    F: Fn(StageInput) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StageOutcome>> + Send,
{
    async fn execute(&self, input: StageInput) -> anyhow::Result<StageOutcome> {
        (self.func)(input).await
    }
}
