//! Stage executors for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::StageError;
use crate::pipeline::{StageExecutor, StageInput, StageOutcome};

/// One scripted reaction of a [`ScriptedExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Succeed with this payload.
    Succeed(Value),
    /// Return a failed outcome that is not retried.
    Fail(String),
    /// Return a failed outcome that may be retried.
    FailRetryable(String),
    /// Raise a transient [`StageError`].
    TransientError(String),
    /// Raise a fatal [`StageError`].
    FatalError(String),
}

impl ScriptStep {
    fn run(self) -> anyhow::Result<StageOutcome> {
        match self {
            Self::Succeed(value) => Ok(StageOutcome::ok_value(value)),
            Self::Fail(message) => Ok(StageOutcome::fail(message)),
            Self::FailRetryable(message) => Ok(StageOutcome::fail_retryable(message)),
            Self::TransientError(message) => Err(StageError::transient(message).into()),
            Self::FatalError(message) => Err(StageError::fatal(message).into()),
        }
    }
}

/// Plays back a script of reactions, one per call, then repeats the
/// fallback.
#[derive(Debug)]
pub struct ScriptedExecutor {
    name: String,
    script: Mutex<VecDeque<ScriptStep>>,
    fallback: ScriptStep,
    calls: Mutex<usize>,
}

impl ScriptedExecutor {
    /// An executor that succeeds with an empty payload until scripted
    /// otherwise.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: ScriptStep::Succeed(Value::Null),
            calls: Mutex::new(0),
        }
    }

    /// An executor that always succeeds with `payload`.
    #[must_use]
    pub fn succeeding(name: impl Into<String>, payload: Value) -> Self {
        Self::new(name).otherwise(ScriptStep::Succeed(payload))
    }

    /// An executor that always fails fatally.
    #[must_use]
    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name).otherwise(ScriptStep::Fail(message.into()))
    }

    /// Appends a step.
    #[must_use]
    pub fn then(self, step: ScriptStep) -> Self {
        self.script.lock().push_back(step);
        self
    }

    /// Appends `count` transient errors.
    #[must_use]
    pub fn then_transient(self, count: usize, message: &str) -> Self {
        {
            let mut script = self.script.lock();
            for _ in 0..count {
                script.push_back(ScriptStep::TransientError(message.to_string()));
            }
        }
        self
    }

    /// Sets the step used once the script is exhausted.
    #[must_use]
    pub fn otherwise(mut self, step: ScriptStep) -> Self {
        self.fallback = step;
        self
    }

    /// Name given at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }

    /// Steps not yet played.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(&self, input: StageInput) -> anyhow::Result<StageOutcome> {
        input.check_cancelled()?;
        *self.calls.lock() += 1;
        let step = self.script.lock().pop_front();
        step.unwrap_or_else(|| self.fallback.clone()).run()
    }
}

/// One call seen by a [`RecordingExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Workflow id.
    pub workflow_id: Uuid,
    /// Stage name.
    pub stage: String,
    /// Attempt number.
    pub attempt: u32,
    /// Accumulated data the stage saw, merged view.
    pub data: Value,
}

/// Records every input and delegates to another executor.
pub struct RecordingExecutor {
    inner: Arc<dyn StageExecutor>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl std::fmt::Debug for RecordingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingExecutor")
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

impl RecordingExecutor {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn StageExecutor>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Records calls and succeeds with `payload`.
    #[must_use]
    pub fn succeeding(payload: Value) -> Self {
        Self::new(Arc::new(ScriptedExecutor::succeeding("recorded", payload)))
    }

    /// Calls seen so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl StageExecutor for RecordingExecutor {
    async fn execute(&self, input: StageInput) -> anyhow::Result<StageOutcome> {
        self.calls.lock().push(RecordedCall {
            workflow_id: input.workflow_id,
            stage: input.stage.clone(),
            attempt: input.attempt,
            data: input.data.merged().clone().into(),
        });
        self.inner.execute(input).await
    }
}
