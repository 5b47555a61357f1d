//! Cooperative cancellation.
//!
//! Stages are never preempted. A token is tripped when its workflow fails,
//! is cancelled, or loses its entity lock; executors check it before
//! expensive work.

mod registry;
mod token;

pub use registry::CancellationRegistry;
pub use token::{CancelCallback, CancellationScope, CancellationToken};
