//! Topic-based broadcast of progress events.
//!
//! One `broadcast` channel per topic. Publishing to a topic nobody listens
//! on drops the event; a subscriber that falls behind skips what it
//! missed. Subscribers hold nothing but a channel receiver.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::event::{ProgressEvent, Topic};
use super::sink::ProgressSink;

/// Default per-topic channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Delivery counters.
#[derive(Debug, Default)]
pub struct PublisherMetrics {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of [`PublisherMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    /// Events handed to `publish`.
    pub published: u64,
    /// Receiver deliveries.
    pub delivered: u64,
    /// Events published to topics without subscribers.
    pub dropped: u64,
}

impl PublisherMetrics {
    /// Takes a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> PublisherStats {
        PublisherStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Publishes progress events to per-tenant and per-entity topics.
#[derive(Debug)]
pub struct ProgressPublisher {
    topics: DashMap<Topic, broadcast::Sender<ProgressEvent>>,
    capacity: usize,
    metrics: PublisherMetrics,
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ProgressPublisher {
    /// Creates a publisher whose topic channels buffer `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            metrics: PublisherMetrics::default(),
        }
    }

    /// Publishes `event` on `topic`. Returns how many subscribers got it.
    pub fn publish(&self, topic: &Topic, event: ProgressEvent) -> usize {
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        let delivered = self
            .topics
            .get(topic)
            .and_then(|sender| sender.send(event).ok())
            .unwrap_or(0);

        if delivered == 0 {
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(%topic, "No subscribers, event dropped");
        } else {
            self.metrics
                .delivered
                .fetch_add(delivered as u64, Ordering::Relaxed);
        }
        delivered
    }

    /// Subscribes to `topic`.
    #[must_use]
    pub fn subscribe(&self, topic: &Topic) -> ProgressSubscription {
        let receiver = self
            .topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        debug!(%topic, "Subscriber attached");
        ProgressSubscription {
            topic: topic.clone(),
            receiver,
            missed: 0,
        }
    }

    /// Live subscribers of `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map_or(0, |s| s.receiver_count())
    }

    /// Number of topics with a channel.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Drops channels whose subscribers are all gone. Returns how many.
    pub fn prune(&self) -> usize {
        let before = self.topics.len();
        self.topics.retain(|_, sender| sender.receiver_count() > 0);
        before - self.topics.len()
    }

    /// Delivery counters.
    #[must_use]
    pub fn stats(&self) -> PublisherStats {
        self.metrics.snapshot()
    }
}

impl ProgressSink for ProgressPublisher {
    fn try_emit(&self, event: ProgressEvent) {
        let [tenant, entity] = event.topics();
        self.publish(&tenant, event.clone());
        self.publish(&entity, event);
    }
}

/// A subscriber's view of one topic.
#[derive(Debug)]
pub struct ProgressSubscription {
    topic: Topic,
    receiver: broadcast::Receiver<ProgressEvent>,
    missed: u64,
}

impl ProgressSubscription {
    /// The subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Events skipped because this subscriber fell behind.
    #[must_use]
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Waits for the next event. `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_next(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(_) => return None,
            }
        }
    }

    fn lagged(&mut self, skipped: u64) {
        self.missed += skipped;
        debug!(topic = %self.topic, skipped, "Subscriber lagged, events skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionMode, StartRequest, Workflow};
    use crate::progress::ProgressEventType;

    fn workflow(entity: &str, merchant: &str) -> Workflow {
        Workflow::new(&StartRequest::new(entity, "f", merchant), ExecutionMode::Direct)
    }

    #[tokio::test]
    async fn test_publish_reaches_topic_subscribers() {
        let publisher = ProgressPublisher::default();
        let wf = workflow("inv-1", "acme");
        let mut tenant = publisher.subscribe(&Topic::tenant("acme"));
        let mut entity = publisher.subscribe(&Topic::entity("inv-1"));
        let mut other = publisher.subscribe(&Topic::tenant("globex"));

        publisher.try_emit(ProgressEvent::stage(&wf, "extraction"));

        assert_eq!(tenant.next().await.unwrap().event_type, ProgressEventType::Stage);
        assert_eq!(entity.next().await.unwrap().workflow_id, wf.id);
        assert!(other.try_next().is_none());
    }

    #[test]
    fn test_no_subscribers_drops() {
        let publisher = ProgressPublisher::default();
        let wf = workflow("inv-1", "acme");
        assert_eq!(publisher.publish(&Topic::entity("inv-1"), ProgressEvent::completion(&wf)), 0);
        assert_eq!(publisher.topic_count(), 0);
        assert_eq!(publisher.stats().dropped, 1);
    }

    #[test]
    fn test_lagging_subscriber_skips() {
        let publisher = ProgressPublisher::new(2);
        let wf = workflow("inv-1", "acme");
        let topic = Topic::entity("inv-1");
        let mut sub = publisher.subscribe(&topic);

        for i in 0..5 {
            publisher.publish(&topic, ProgressEvent::progress(&wf, "extraction", format!("step {i}")));
        }

        let first = sub.try_next().unwrap();
        assert_eq!(first.message, "step 3");
        assert_eq!(sub.missed(), 3);
        assert_eq!(sub.try_next().unwrap().message, "step 4");
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn test_prune_idle_topics() {
        let publisher = ProgressPublisher::default();
        let kept = publisher.subscribe(&Topic::tenant("acme"));
        {
            let _gone = publisher.subscribe(&Topic::tenant("globex"));
        }
        assert_eq!(publisher.topic_count(), 2);
        assert_eq!(publisher.prune(), 1);
        assert_eq!(publisher.subscriber_count(kept.topic()), 1);
    }

    #[test]
    fn test_many_subscribers_share_channel() {
        let publisher = ProgressPublisher::default();
        let topic = Topic::tenant("acme");
        let subs: Vec<_> = (0..100).map(|_| publisher.subscribe(&topic)).collect();
        assert_eq!(publisher.topic_count(), 1);
        let wf = workflow("inv-1", "acme");
        assert_eq!(publisher.publish(&topic, ProgressEvent::completion(&wf)), subs.len());
    }
}
