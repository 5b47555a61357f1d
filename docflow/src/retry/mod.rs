//! Retry and backoff engine.
//!
//! - [`ErrorClassifier`] maps errors onto [`ErrorClass`](crate::errors::ErrorClass)
//! - [`RetryPolicy`] computes delays and retry decisions
//! - [`RetryLayer`] wraps async operations with a policy
//! - [`UniqueKeyResolver`] bounds unique-key conflict resolution

mod classify;
mod conflict;
mod middleware;
mod policy;

pub use classify::ErrorClassifier;
pub use conflict::{ResolvedKey, UniqueKeyResolver, DEFAULT_MAX_KEY_ATTEMPTS};
pub use middleware::RetryLayer;
pub use policy::{BackoffStrategy, JitterStrategy, RetryDecision, RetryPolicies, RetryPolicy};
