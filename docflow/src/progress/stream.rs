//! Server-sent-events framing for live subscribers.

use futures::stream::{self, Stream};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::event::ProgressEvent;
use super::publisher::ProgressSubscription;

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A progress event.
    Event(ProgressEvent),
    /// Keeps idle connections open.
    Heartbeat,
}

impl SseFrame {
    /// Renders the frame.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Event(event) => encode_event(event),
            Self::Heartbeat => ": heartbeat\n\n".to_string(),
        }
    }
}

/// Renders `event` as `event: <type>` plus one JSON `data:` line.
#[must_use]
pub fn encode_event(event: &ProgressEvent) -> String {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("event: {}\ndata: {data}\n\n", event.event_type)
}

/// Turns a subscription into frames, with a heartbeat whenever `heartbeat`
/// passes. Ends when the publisher goes away.
pub fn sse_frames(subscription: ProgressSubscription, heartbeat: Duration) -> impl Stream<Item = SseFrame> + Send {
    let every = heartbeat.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    stream::unfold((subscription, ticker), |(mut subscription, mut ticker)| async move {
        tokio::select! {
            event = subscription.next() => {
                event.map(|event| (SseFrame::Event(event), (subscription, ticker)))
            }
            _ = ticker.tick() => Some((SseFrame::Heartbeat, (subscription, ticker))),
        }
    })
}
