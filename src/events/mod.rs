//! Event system for streamer state notifications
//!
//! A broadcast bus the application subscribes to for "connections changed"
//! style notifications and viewer input.

pub mod types;

pub use types::StreamerEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for [`StreamerEvent`]s
///
/// The streamer publishes connection changes and viewer input here; the
/// application and the binary's logging task subscribe. Every active
/// subscriber receives every event.
///
/// # Example
///
/// ```no_run
/// use pixelcast::events::{EventBus, StreamerEvent};
///
/// let bus = EventBus::new();
///
/// // Subscribe before publishing; earlier events are not replayed
/// let mut rx = bus.subscribe();
///
/// bus.publish(StreamerEvent::AllConnectionsClosed);
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("{}", event.event_name());
///     }
/// });
/// ```
pub struct EventBus {
    /// Sending half of the broadcast ring buffer
    tx: broadcast::Sender<StreamerEvent>,
}

impl EventBus {
    /// Create an event bus with no subscribers
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Events published while nobody is subscribed are dropped.
    ///
    /// # Arguments
    ///
    /// * `event` - The event to deliver
    pub fn publish(&self, event: StreamerEvent) {
        // Err only means there are no receivers
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events
    ///
    /// The receiver reads from a ring buffer of `EVENT_CHANNEL_CAPACITY`
    /// events. A subscriber that falls further behind receives
    /// `RecvError::Lagged` and misses the overwritten events.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamerEvent> {
        self.tx.subscribe()
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(StreamerEvent::SignallingConnected {
            url: "ws://127.0.0.1:8888".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, StreamerEvent::SignallingConnected { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(StreamerEvent::AllConnectionsClosed);

        assert!(matches!(
            rx1.recv().await.unwrap(),
            StreamerEvent::AllConnectionsClosed
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            StreamerEvent::AllConnectionsClosed
        ));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(StreamerEvent::AllConnectionsClosed);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
