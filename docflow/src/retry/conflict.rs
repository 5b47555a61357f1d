//! Bounded resolution of unique business keys under contention.
//!
//! Resolution must finish before any time-budgeted transaction opens. After
//! `max_attempts` taken candidates the resolver stops probing and returns a
//! synthetic key that cannot collide.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Default number of candidates probed before falling back.
pub const DEFAULT_MAX_KEY_ATTEMPTS: u32 = 10;

/// A resolved unique key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedKey {
    /// The key to use.
    pub key: String,
    /// Candidates probed, including the winner.
    pub attempts: u32,
    /// True when the synthetic fallback was used.
    pub fallback: bool,
}

/// Probes `base`, `base-2`, `base-3`, ... and falls back to
/// `base-<uuid v7>` when all of them are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueKeyResolver {
    max_attempts: u32,
}

impl Default for UniqueKeyResolver {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_KEY_ATTEMPTS,
        }
    }
}

impl UniqueKeyResolver {
    /// Creates a resolver with the default cap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cap. Zero goes straight to the fallback.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Returns the cap.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The `n`-th candidate (1-based) for `base`.
    #[must_use]
    pub fn candidate(base: &str, n: u32) -> String {
        if n <= 1 {
            base.to_string()
        } else {
            format!("{base}-{n}")
        }
    }

    /// A key derived from `base` that is unique without probing.
    #[must_use]
    pub fn synthetic(base: &str) -> String {
        format!("{base}-{}", Uuid::now_v7().simple())
    }

    /// Resolves a key. `try_claim` returns `Ok(true)` when it reserved the
    /// candidate and `Ok(false)` when the candidate is taken.
    pub async fn resolve<F, Fut, E>(&self, base: &str, mut try_claim: F) -> Result<ResolvedKey, E>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        for n in 1..=self.max_attempts {
            let candidate = Self::candidate(base, n);
            if try_claim(candidate.clone()).await? {
                debug!(key = %candidate, attempts = n, "Resolved unique key");
                return Ok(ResolvedKey {
                    key: candidate,
                    attempts: n,
                    fallback: false,
                });
            }
        }

        let key = Self::synthetic(base);
        warn!(
            base,
            attempts = self.max_attempts,
            key = %key,
            "Unique key candidates exhausted, using synthetic key"
        );
        Ok(ResolvedKey {
            key,
            attempts: self.max_attempts,
            fallback: true,
        })
    }
}
