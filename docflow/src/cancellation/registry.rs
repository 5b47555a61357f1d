//! Per-workflow cancellation tokens shared within a process.

use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::token::CancellationToken;

/// Hands out one token per workflow id.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: DashMap<Uuid, Arc<CancellationToken>>,
}

impl CancellationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token for `workflow_id`, creating it if needed.
    #[must_use]
    pub fn token_for(&self, workflow_id: Uuid) -> Arc<CancellationToken> {
        self.tokens
            .entry(workflow_id)
            .or_insert_with(|| Arc::new(CancellationToken::new()))
            .clone()
    }

    /// Cancels the workflow's token. Returns true if this call cancelled it.
    pub fn cancel(&self, workflow_id: Uuid, reason: impl Into<String>) -> bool {
        self.token_for(workflow_id).cancel(reason)
    }

    /// Forgets the workflow. Holders of the token keep their reference.
    pub fn remove(&self, workflow_id: Uuid) {
        self.tokens.remove(&workflow_id);
    }

    /// Number of tracked workflows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns true if no workflow is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
