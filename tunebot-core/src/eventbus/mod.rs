//! src/eventbus/mod.rs
//!
//! Provides an in-process event bus that supports guaranteed delivery
//! to multiple subscribers via bounded MPSC queues.

use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, GuildMarker};

use tunebot_common::models::PlaybackState;

/// Events published by the playback controller for whoever is listening
/// (the Discord runtime posts notices, tests observe transitions).
#[derive(Debug, Clone)]
pub enum BotEvent {
    /// A session moved between playback states.
    StateChanged {
        guild_id: Id<GuildMarker>,
        from: PlaybackState,
        to: PlaybackState,
    },

    /// Text for the session's announce channel ("Now playing: …", "Error playing track …").
    PlaybackNotice {
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        text: String,
    },
}

impl BotEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            BotEvent::StateChanged { .. } => "state_changed",
            BotEvent::PlaybackNotice { .. } => "playback_notice",
        }
    }

    pub fn guild_id(&self) -> Id<GuildMarker> {
        match self {
            BotEvent::StateChanged { guild_id, .. } | BotEvent::PlaybackNotice { guild_id, .. } => *guild_id,
        }
    }
}

/// Each subscriber gets its own `mpsc::Sender<BotEvent>` for guaranteed delivery.
///
/// - If the subscriber’s channel buffer fills, `publish` will await
///   until there's space (backpressure).
/// - If the subscriber has dropped the `Receiver`, the channel is closed
///   and the sender is pruned on the next publish.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<BotEvent>>>>,
    shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Default size for each subscriber’s buffer.
const DEFAULT_BUFFER_SIZE: usize = 10000;

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new, empty event bus.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            subscribers: Arc::new(Mutex::new(vec![])),
            shutdown_tx: tx,
            shutdown_rx: rx,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Returns a receiver on which events will be delivered.
    pub async fn subscribe(&self, buffer_size: Option<usize>) -> mpsc::Receiver<BotEvent> {
        let size = buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let (tx, rx) = mpsc::channel(size);
        let mut subs = self.subscribers.lock().await;
        subs.push(tx);
        rx
    }

    /// Publish an event to all subscribers.
    pub async fn publish(&self, event: BotEvent) {
        let senders = {
            let mut subs = self.subscribers.lock().await;
            subs.retain(|s| !s.is_closed());
            subs.clone()
        };
        for s in senders {
            let _ = s.send(event.clone()).await;
        }
    }

    /// Convenience method: publish a `PlaybackNotice` event.
    pub async fn publish_notice(
        &self,
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        text: &str,
    ) {
        self.publish(BotEvent::PlaybackNotice {
            guild_id,
            channel_id,
            text: text.to_string(),
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout, Duration};

    fn notice(text: &str) -> BotEvent {
        BotEvent::PlaybackNotice {
            guild_id: Id::new(1),
            channel_id: Id::new(2),
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();

        let mut rx1 = bus.subscribe(Some(5)).await;
        let mut rx2 = bus.subscribe(Some(5)).await;

        bus.publish(BotEvent::StateChanged {
            guild_id: Id::new(1),
            from: PlaybackState::Idle,
            to: PlaybackState::Connecting,
        })
        .await;

        let evt1 = rx1.recv().await.expect("rx1 should get event");
        let evt2 = rx2.recv().await.expect("rx2 should get event");

        assert_eq!(evt1.event_type(), "state_changed");
        assert_eq!(evt2.event_type(), "state_changed");
    }

    #[tokio::test]
    async fn test_backpressure_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Some(1)).await; // queue size = 1

        bus.publish(notice("msg1")).await;

        // Spawn a task that reads the two messages after a short delay.
        let handle = tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            let first = rx.recv().await.expect("expected first message");
            let second = rx.recv().await.expect("expected second message");
            (first, second)
        });

        // Publish the second message (this call will wait until there's space).
        let result = timeout(Duration::from_millis(500), bus.publish(notice("msg2"))).await;
        assert!(result.is_ok(), "publish should eventually unblock");

        let (evt1, evt2) = handle.await.unwrap();
        match (evt1, evt2) {
            (BotEvent::PlaybackNotice { text: a, .. }, BotEvent::PlaybackNotice { text: b, .. }) => {
                assert_eq!(a, "msg1");
                assert_eq!(b, "msg2");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_block_publish() {
        let bus = EventBus::new();
        let rx = bus.subscribe(Some(1)).await;
        drop(rx);

        let result = timeout(Duration::from_millis(200), bus.publish(notice("x"))).await;
        assert!(result.is_ok());
        assert!(bus.subscribers.lock().await.is_empty());
    }

    #[test]
    fn test_shutdown_flag() {
        let bus = EventBus::new();
        assert!(!bus.is_shutdown());
        bus.shutdown();
        assert!(bus.is_shutdown());
    }
}
