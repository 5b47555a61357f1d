//! Progress sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, Level};

use super::event::{ProgressEvent, ProgressEventType};

/// Receives progress events from the controller.
///
/// Delivery is best-effort: sinks never fail and never block the caller.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: ProgressEvent) {
        self.try_emit(event);
    }

    /// Emits an event without blocking. Errors are logged and suppressed.
    fn try_emit(&self, event: ProgressEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgressSink;

impl ProgressSink for NoOpProgressSink {
    fn try_emit(&self, _event: ProgressEvent) {}
}

/// Logs events through tracing.
#[derive(Debug, Clone)]
pub struct LoggingProgressSink {
    level: Level,
}

impl Default for LoggingProgressSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingProgressSink {
    /// Creates a logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl ProgressSink for LoggingProgressSink {
    fn try_emit(&self, event: ProgressEvent) {
        if self.level == Level::DEBUG {
            debug!(
                workflow_id = %event.workflow_id,
                event_type = %event.event_type,
                stage = ?event.stage,
                percent = event.percent,
                "{}", event.message
            );
        } else {
            info!(
                workflow_id = %event.workflow_id,
                event_type = %event.event_type,
                stage = ?event.stage,
                percent = event.percent,
                "{}", event.message
            );
        }
    }
}

/// Collects events in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingProgressSink {
    events: RwLock<Vec<ProgressEvent>>,
}

impl CollectingProgressSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.read().clone()
    }

    /// Events of one type.
    #[must_use]
    pub fn events_of_type(&self, event_type: ProgressEventType) -> Vec<ProgressEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Drops all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl ProgressSink for CollectingProgressSink {
    fn try_emit(&self, event: ProgressEvent) {
        self.events.write().push(event);
    }
}

/// Fans events out to several sinks.
#[derive(Default, Clone)]
pub struct CompositeProgressSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl CompositeProgressSink {
    /// Creates an empty composite.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns true if there are no sinks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for CompositeProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeProgressSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl ProgressSink for CompositeProgressSink {
    fn try_emit(&self, event: ProgressEvent) {
        for sink in &self.sinks {
            sink.try_emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionMode, StartRequest, Workflow};

    fn event() -> ProgressEvent {
        let wf = Workflow::new(&StartRequest::new("e", "f", "m"), ExecutionMode::Direct);
        ProgressEvent::stage(&wf, "extraction")
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        NoOpProgressSink.emit(event()).await;
        LoggingProgressSink::default().try_emit(event());
        LoggingProgressSink::debug().emit(event()).await;
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingProgressSink::new();
        assert!(sink.is_empty());

        sink.emit(event()).await;
        sink.try_emit(event());
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events_of_type(ProgressEventType::Stage).len(), 2);
        assert!(sink.events_of_type(ProgressEventType::Error).is_empty());

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_composite_fans_out() {
        let first = Arc::new(CollectingProgressSink::new());
        let second = Arc::new(CollectingProgressSink::new());
        let composite = CompositeProgressSink::new()
            .with(first.clone())
            .with(second.clone());

        composite.try_emit(event());
        assert_eq!(composite.len(), 2);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }
}
