//! Progress publisher.
//!
//! Best-effort, at-most-once, unpersisted notifications. Clients reconcile
//! by polling the workflow record when they miss events.

mod event;
mod publisher;
mod sink;
mod stream;

pub use event::{ProgressEvent, ProgressEventType, Topic};
pub use publisher::{
    ProgressPublisher, ProgressSubscription, PublisherMetrics, PublisherStats,
    DEFAULT_CHANNEL_CAPACITY,
};
pub use sink::{
    CollectingProgressSink, CompositeProgressSink, LoggingProgressSink, NoOpProgressSink,
    ProgressSink,
};
pub use stream::{encode_event, sse_frames, SseFrame, DEFAULT_HEARTBEAT};
