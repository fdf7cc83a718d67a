//! Broadcast channel for connection events.
//!
//! [`EventBus`] wraps a [`tokio::sync::broadcast`] channel. The connection
//! manager owns one bus, injects it into every connection it creates as a
//! [`ConnectionObserver`], and hands receivers to collaborators.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;

use super::ConnectionEvent;

/// Receives events from a connection task.
///
/// Observers are called synchronously on the connection task, in emission
/// order, so they must not block.
pub trait ConnectionObserver: Send + Sync {
    /// Handles one event.
    fn on_event(&self, event: &ConnectionEvent);
}

impl<F> ConnectionObserver for F
where
    F: Fn(&ConnectionEvent) + Send + Sync,
{
    fn on_event(&self, event: &ConnectionEvent) {
        self(event);
    }
}

/// Shared list of observers injected into a connection.
#[derive(Clone, Default)]
pub struct Observers(Vec<Arc<dyn ConnectionObserver>>);

impl Observers {
    /// Creates an empty observer list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observer.
    #[must_use]
    pub fn with(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.0.push(observer);
        self
    }

    /// Delivers `event` to every observer, in registration order.
    pub fn emit(&self, event: &ConnectionEvent) {
        for observer in &self.0 {
            observer.on_event(event);
        }
    }

    /// Returns the number of observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no observers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers").field("len", &self.0.len()).finish()
    }
}

/// Broadcast bus for [`ConnectionEvent`]s.
///
/// Backed by a `tokio::broadcast` channel with a configurable capacity
/// (default 10 000). When the ring buffer is full, the oldest events are
/// dropped for lagging receivers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    /// Creates a new `EventBus` with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of receivers that received the event.
    /// If there are no active receivers, the event is silently dropped.
    pub fn publish(&self, event: ConnectionEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Creates a new receiver that will receive all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    /// Returns the current number of active receivers.
    #[cfg(test)]
    pub(crate) fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl ConnectionObserver for EventBus {
    fn on_event(&self, event: &ConnectionEvent) {
        let _ = self.publish(event.clone());
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;

    fn make_event(connection_id: &str) -> ConnectionEvent {
        ConnectionEvent::ConnectionRemoved {
            connection_id: connection_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn publish_without_receivers_returns_zero() {
        let bus = EventBus::new(100);
        assert_eq!(bus.publish(make_event("c1")), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_event() {
        let bus = EventBus::new(100);
        let mut rx = bus.subscribe();

        bus.publish(make_event("c1"));

        let Ok(event) = rx.recv().await else {
            panic!("expected to receive event");
        };
        assert_eq!(event.connection_id(), "c1");
    }

    #[tokio::test]
    async fn bus_as_observer_relays_events() {
        let bus = EventBus::new(100);
        let mut rx = bus.subscribe();
        let observers = Observers::new().with(Arc::new(bus.clone()));

        observers.emit(&make_event("relay"));

        let Ok(event) = rx.recv().await else {
            panic!("relay failed");
        };
        assert_eq!(event.connection_id(), "relay");
    }

    #[test]
    fn closures_are_observers_called_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let second = Arc::clone(&seen);
        let observers = Observers::new()
            .with(Arc::new(move |e: &ConnectionEvent| {
                if let Ok(mut log) = first.lock() {
                    log.push(format!("first:{}", e.connection_id()));
                }
            }))
            .with(Arc::new(move |e: &ConnectionEvent| {
                if let Ok(mut log) = second.lock() {
                    log.push(format!("second:{}", e.connection_id()));
                }
            }));

        observers.emit(&make_event("c9"));

        let log = seen.lock().map(|l| l.clone()).unwrap_or_default();
        assert_eq!(log, vec!["first:c9".to_string(), "second:c9".to_string()]);
        assert_eq!(observers.len(), 2);
    }

    #[test]
    fn receiver_count_tracks_subscribers() {
        let bus = EventBus::new(100);
        assert_eq!(bus.receiver_count(), 0);
        let rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!(bus.receiver_count(), 2);
        drop(rx1);
        assert_eq!(bus.receiver_count(), 1);
    }
}
