//! Stage queues: jobs, brokers, and the worker dispatcher.

mod broker;
mod dispatcher;
mod job;
mod options;

pub use broker::{Broker, MemoryBroker, StallReport, STALLED_REASON};
pub use dispatcher::{JobHandler, StageQueueDispatcher};
pub use job::{job_id, EnqueueOptions, EnqueueOutcome, Job, JobCounts, JobPayload, JobState};
pub use options::QueueOptions;
