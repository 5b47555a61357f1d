//! Error classification into retryable and fatal.
//!
//! Typed errors from this crate classify themselves. Anything else is
//! matched against transient-failure signatures; what matches nothing is
//! fatal.

use regex::Regex;
use std::error::Error as StdError;
use std::io;

use crate::errors::{
    BrokerError, ConfigError, DocflowError, ErrorClass, LockError, PoolError, StageError,
    StoreError,
};

/// Case-insensitive signatures of transient infrastructure failures.
const TRANSIENT_PATTERNS: &[&str] = &[
    r"(?i)connection\W+(is\W+)?not\W+(yet\W+)?(ready|established|open)",
    r"(?i)connection\W+(refused|reset|closed|aborted|lost)",
    r"(?i)\bnot\W+connected\b",
    r"(?i)\b(timed?\W?out|deadline exceeded)\b",
    r"(?i)temporar(y|ily)\W+unavailable",
    r"(?i)service\W+unavailable|\b503\b",
    r"(?i)pool\W+(exhausted|timeout|timed out)",
    r"(?i)too\W+many\W+(connections|clients|requests)",
    r"(?i)\b(econnreset|econnrefused|etimedout|epipe|ehostunreach)\b",
    r"(?i)deadlock\W+detected|could\W+not\W+serialize",
    r"(?i)rate\W+limit",
];

/// Classifies errors for the retry engine.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    transient: Vec<Regex>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            transient: TRANSIENT_PATTERNS
                .iter()
                .filter_map(|pattern| Regex::new(pattern).ok())
                .collect(),
        }
    }
}

impl ErrorClassifier {
    /// Creates a classifier with the built-in transient signatures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a transient signature. The pattern is matched case-insensitively.
    pub fn with_transient_pattern(mut self, pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(&format!("(?i){pattern}"))
            .map_err(|e| ConfigError::invalid("retry.transient_patterns", e.to_string()))?;
        self.transient.push(regex);
        Ok(self)
    }

    /// Classifies an `anyhow` error by walking its cause chain.
    #[must_use]
    pub fn classify(&self, error: &anyhow::Error) -> ErrorClass {
        for cause in error.chain() {
            if let Some(class) = typed_class(cause) {
                return class;
            }
        }
        self.classify_message(&format!("{error:#}"))
    }

    /// Classifies any standard error by walking its `source` chain.
    #[must_use]
    pub fn classify_error(&self, error: &(dyn StdError + 'static)) -> ErrorClass {
        let mut current = Some(error);
        let mut rendered = String::new();
        while let Some(cause) = current {
            if let Some(class) = typed_class(cause) {
                return class;
            }
            if !rendered.is_empty() {
                rendered.push_str(": ");
            }
            rendered.push_str(&cause.to_string());
            current = cause.source();
        }
        self.classify_message(&rendered)
    }

    /// Classifies a bare error message.
    #[must_use]
    pub fn classify_message(&self, message: &str) -> ErrorClass {
        if self.transient.iter().any(|re| re.is_match(message)) {
            ErrorClass::Retryable
        } else {
            ErrorClass::Fatal
        }
    }
}

fn typed_class(cause: &(dyn StdError + 'static)) -> Option<ErrorClass> {
    if let Some(e) = cause.downcast_ref::<DocflowError>() {
        return Some(e.class());
    }
    if let Some(e) = cause.downcast_ref::<StageError>() {
        return Some(e.class());
    }
    if let Some(e) = cause.downcast_ref::<StoreError>() {
        return Some(e.class());
    }
    if let Some(e) = cause.downcast_ref::<LockError>() {
        return Some(e.class());
    }
    if let Some(e) = cause.downcast_ref::<BrokerError>() {
        return Some(e.class());
    }
    if let Some(e) = cause.downcast_ref::<PoolError>() {
        return Some(e.class());
    }
    if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return Some(ErrorClass::Retryable);
    }
    if let Some(e) = cause.downcast_ref::<io::Error>() {
        return Some(io_class(e));
    }
    None
}

fn io_class(error: &io::Error) -> ErrorClass {
    match error.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::Interrupted => ErrorClass::Retryable,
        _ => ErrorClass::Fatal,
    }
}
