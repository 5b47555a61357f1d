//! Retry decorator composed around fallible async operations.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use super::classify::ErrorClassifier;
use super::policy::{RetryDecision, RetryPolicy};
use crate::errors::ErrorClass;

/// Retries an operation according to a policy and a classifier.
///
/// The layer is built once and handed to the component that needs it, so
/// which calls retry (and how) is decided at construction time.
#[derive(Debug, Clone)]
pub struct RetryLayer {
    name: String,
    policy: RetryPolicy,
    classifier: Arc<ErrorClassifier>,
}

impl RetryLayer {
    /// Creates a layer with the default classifier.
    #[must_use]
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            classifier: Arc::new(ErrorClassifier::default()),
        }
    }

    /// Uses a shared classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Returns the layer name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation`, retrying retryable errors. The closure receives the
    /// 1-based attempt number.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        self.call_with(operation, |_, class| class.is_retryable()).await
    }

    /// Like [`call`](Self::call), but `retry_if` decides per error whether a
    /// retryable failure should actually be retried.
    pub async fn call_with<T, E, F, Fut, P>(&self, mut operation: F, retry_if: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
        P: Fn(&E, ErrorClass) -> bool,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let class = self.classifier.classify_error(&error);
                    let class = if retry_if(&error, class) {
                        class
                    } else {
                        ErrorClass::Fatal
                    };
                    match self.policy.decide(attempt, class) {
                        RetryDecision::Retry(delay) => {
                            debug!(
                                layer = %self.name,
                                attempt,
                                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                error = %error,
                                "Retrying after error"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        RetryDecision::GiveUp => {
                            warn!(layer = %self.name, attempt, error = %error, "Retries exhausted");
                            return Err(error);
                        }
                        RetryDecision::NotRetryable => return Err(error),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::retry::JitterStrategy;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(max_attempts)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None)
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let layer = RetryLayer::new("test", fast_policy(5));
        let calls = AtomicU32::new(0);

        let result: Result<u32, StoreError> = layer
            .call(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(StoreError::Unavailable("connection not ready".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let layer = RetryLayer::new("test", fast_policy(5));
        let calls = AtomicU32::new(0);

        let result: Result<(), StoreError> = layer
            .call(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Serialization("bad json".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let layer = RetryLayer::new("test", fast_policy(3));
        let calls = AtomicU32::new(0);

        let result: Result<(), StoreError> = layer
            .call(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Unavailable("down".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_if_can_veto() {
        let layer = RetryLayer::new("test", fast_policy(5));
        let calls = AtomicU32::new(0);

        let result: Result<(), StoreError> = layer
            .call_with(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(StoreError::conflict("wf:1")) }
                },
                |error, class| class.is_retryable() && !error.is_conflict(),
            )
            .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
