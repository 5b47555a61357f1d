//! Logging setup and timing helpers.

mod tracing;

pub use tracing::{build_env_filter, init_tracing, LogFormat, SpanTimer, LOG_ENV_VAR};
