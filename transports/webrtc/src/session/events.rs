//! Observer events raised by the session manager

use super::state::ConnectionState;
use crate::media::stream::MediaStream;
use crate::signaling::protocol::StreamId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events delivered to observers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connection state changed; `error` carries a human-readable reason or
    /// the reconnect countdown
    StateChanged {
        state: ConnectionState,
        error: Option<String>,
    },

    /// The relay replaced the stream list
    StreamsChanged { streams: Vec<StreamId> },

    /// A stream was published
    StreamAdded { stream_id: StreamId },

    /// A stream ended
    StreamRemoved { stream_id: StreamId },

    /// An inbound stream is playable
    Track { stream: MediaStream },

    /// Relay timing sample, seconds since the Unix epoch
    AudioData { timestamp: f64 },

    /// The relay refused a request
    ServerError { message: String },
}

/// Observer registration handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Callback for session events
pub type SessionObserver = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Synchronous fan-out to observers in registration order
#[derive(Default)]
pub struct EventBus {
    observers: Mutex<Vec<(SubscriptionId, SessionObserver)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    /// Forward every event into an unbounded channel
    ///
    /// ```
    /// # tokio_test::block_on(async {
    /// use voicestream_webrtc::session::{EventBus, SessionEvent};
    ///
    /// let bus = EventBus::new();
    /// let (_id, mut rx) = bus.subscribe_channel();
    /// bus.emit(SessionEvent::AudioData { timestamp: 1.0 });
    /// assert!(rx.recv().await.is_some());
    /// # });
    /// ```
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Deliver `event` to every observer.
    ///
    /// Observers run on a snapshot of the list, so they may subscribe,
    /// unsubscribe or call back into the manager.
    pub fn emit(&self, event: SessionEvent) {
        let observers: Vec<SessionObserver> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        for observer in observers {
            observer(&event);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let log = log.clone();
            bus.subscribe(move |_| log.lock().push(name));
        }
        bus.emit(SessionEvent::AudioData { timestamp: 1.0 });

        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let id = bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(SessionEvent::AudioData { timestamp: 1.0 });
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(SessionEvent::AudioData { timestamp: 2.0 });

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.observer_count(), 0);
    }

    #[test]
    fn test_observer_may_reenter_bus() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.subscribe(move |_| {
            inner.subscribe(|_| {});
        });

        bus.emit(SessionEvent::AudioData { timestamp: 1.0 });
        assert_eq!(bus.observer_count(), 2);
    }

    #[tokio::test]
    async fn test_channel_adapter() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe_channel();

        bus.emit(SessionEvent::StreamAdded {
            stream_id: "s1".into(),
        });
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::StreamAdded {
                stream_id: "s1".into()
            })
        );
    }
}
