//! Workflow state store.
//!
//! [`KvStore`] is the contract with the durable store. On top of it:
//! [`WorkflowStateStore`] keeps stage results, [`WorkflowRepository`] keeps
//! workflow records, and [`TransactionRunner`] commits both atomically
//! through the shared [`ConnectionPool`].

mod file;
mod kv;
mod memory;
mod merge;
mod pool;
mod state;
mod transaction;
mod workflows;

pub use file::FileKvStore;
pub use kv::{expiry_from_now, KvEntry, KvOp, KvStore};
pub use memory::MemoryKvStore;
pub use merge::{AccumulatedData, FieldCollision};
pub use pool::{ConnectionPool, PoolOptions, PooledConnection};
pub use state::{payload_hash, SaveOutcome, StageResult, WorkflowStateStore};
pub use transaction::{Transaction, TransactionRunner};
pub use workflows::WorkflowRepository;
