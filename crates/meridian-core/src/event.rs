//! Lifecycle event model and the process-wide event bus.
//!
//! The bus is a broadcast-based publish-subscribe surface: `publish`
//! never blocks and never fails observably to the producer. Subscribers
//! receive events on their own tasks, so a slow consumer cannot stall
//! an endpoint driver.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;

/// Severity of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// What happened. Each kind carries a fixed severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A connect attempt succeeded and the endpoint is ready.
    EndpointConnected,
    /// A single connect attempt failed; the endpoint keeps retrying.
    EndpointConnectionFailed,
    /// A pending connect was abandoned because disconnect was
    /// requested while still connecting.
    EndpointConnectionAborted,
    /// A channel became ready after disconnect had been requested and
    /// was closed without ever being used.
    EndpointConnectionIgnored,
    /// The endpoint disconnected.
    EndpointDisconnected,
    /// Closing the channel during disconnect failed.
    EndpointDisconnectionFailed,
    /// Events were dropped while no subscriber was attached.
    EventsDropped,
}

impl EventKind {
    /// The severity this kind is always published at.
    pub const fn severity(&self) -> Severity {
        match self {
            EventKind::EndpointConnected => Severity::Debug,
            EventKind::EndpointConnectionFailed => Severity::Warn,
            EventKind::EndpointConnectionAborted => Severity::Debug,
            EventKind::EndpointConnectionIgnored => Severity::Info,
            EventKind::EndpointDisconnected => Severity::Debug,
            EventKind::EndpointDisconnectionFailed => Severity::Warn,
            EventKind::EventsDropped => Severity::Info,
        }
    }

    /// Coarse grouping used for filtering subscribers.
    pub const fn category(&self) -> &'static str {
        match self {
            EventKind::EventsDropped => "system",
            _ => "endpoint",
        }
    }
}

/// A single diagnostic or lifecycle event.
#[derive(Debug, Clone)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Severity, always `kind.severity()`.
    pub severity: Severity,
    /// Duration of the operation the event describes, when one exists
    /// (connect attempt elapsed, time connected before disconnect).
    pub duration: Option<Duration>,
    /// Human-readable description.
    pub description: String,
    /// Rendered cause when the event reports a failure.
    pub cause: Option<String>,
    /// Canonical ordered export of the originating context.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl Event {
    fn new(kind: EventKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            duration: None,
            description: description.into(),
            cause: None,
            context: BTreeMap::new(),
        }
    }

    /// Successful connect; `duration` is the elapsed time of the
    /// succeeding attempt.
    pub fn endpoint_connected(
        duration: Duration,
        context: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let mut event = Self::new(EventKind::EndpointConnected, "Endpoint connected");
        event.duration = Some(duration);
        event.context = context;
        event
    }

    /// Failed connect attempt; `duration` is the attempt elapsed.
    pub fn endpoint_connection_failed(
        duration: Duration,
        cause: impl std::fmt::Display,
        context: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let mut event = Self::new(
            EventKind::EndpointConnectionFailed,
            "Endpoint connect attempt failed",
        );
        event.duration = Some(duration);
        event.cause = Some(cause.to_string());
        event.context = context;
        event
    }

    /// Connect abandoned after a disconnect request.
    pub fn endpoint_connection_aborted(
        duration: Duration,
        context: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let mut event = Self::new(
            EventKind::EndpointConnectionAborted,
            "Endpoint connect aborted after disconnect was requested",
        );
        event.duration = Some(duration);
        event.context = context;
        event
    }

    /// Late channel arrival after disconnect; the channel was closed
    /// without entering service.
    pub fn endpoint_connection_ignored(context: BTreeMap<String, serde_json::Value>) -> Self {
        let mut event = Self::new(
            EventKind::EndpointConnectionIgnored,
            "Endpoint connected after disconnect was requested, ignoring",
        );
        event.context = context;
        event
    }

    /// Clean disconnect. `last_connected_for` is set when the endpoint
    /// had been connected (absent for connect-phase teardowns).
    pub fn endpoint_disconnected(
        last_connected_for: Option<Duration>,
        context: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let mut event = Self::new(
            EventKind::EndpointDisconnected,
            "Endpoint disconnected successfully",
        );
        event.duration = last_connected_for;
        event.context = context;
        event
    }

    /// Disconnect failed while closing the channel.
    pub fn endpoint_disconnection_failed(
        cause: impl std::fmt::Display,
        context: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let mut event = Self::new(
            EventKind::EndpointDisconnectionFailed,
            "Endpoint disconnect failed",
        );
        event.cause = Some(cause.to_string());
        event.context = context;
        event
    }

    fn events_dropped(count: u64) -> Self {
        Self::new(
            EventKind::EventsDropped,
            format!("{count} events dropped while no subscriber was attached"),
        )
    }
}

/// Process-wide publish surface for lifecycle and diagnostic events.
///
/// `publish` must be non-blocking and must not fail observably to the
/// producer.
pub trait EventBus: Send + Sync + std::fmt::Debug {
    /// Publishes an event to all current subscribers. Never blocks.
    fn publish(&self, event: Event);

    /// Attaches a new subscriber. Subscribers that fall behind the
    /// channel capacity miss events rather than applying backpressure.
    fn subscribe(&self) -> broadcast::Receiver<Event>;
}

/// Default bus backed by a tokio broadcast channel.
#[derive(Debug)]
pub struct DefaultEventBus {
    tx: broadcast::Sender<Event>,
    dropped: AtomicU64,
}

impl DefaultEventBus {
    /// Default broadcast capacity.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Creates a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Creates a bus with an explicit broadcast capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of events dropped so far because no subscriber was
    /// attached. Resets after a recovery notice is published.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for DefaultEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for DefaultEventBus {
    fn publish(&self, event: Event) {
        match self.tx.send(event) {
            Ok(_) => {
                let dropped = self.dropped.swap(0, Ordering::Relaxed);
                if dropped > 0 {
                    let _ = self.tx.send(Event::events_dropped(dropped));
                }
            }
            Err(_) => {
                // No subscribers; count the drop so capacity recovery
                // can report it.
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_carry_fixed_severities() {
        assert_eq!(EventKind::EndpointConnected.severity(), Severity::Debug);
        assert_eq!(EventKind::EndpointConnectionFailed.severity(), Severity::Warn);
        assert_eq!(EventKind::EndpointConnectionIgnored.severity(), Severity::Info);
        assert_eq!(
            EventKind::EndpointDisconnectionFailed.severity(),
            Severity::Warn
        );
    }

    #[test]
    fn disconnected_description_is_stable() {
        let event = Event::endpoint_disconnected(None, BTreeMap::new());
        assert_eq!(event.description, "Endpoint disconnected successfully");
        assert_eq!(event.severity, Severity::Debug);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = DefaultEventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::endpoint_connected(
            Duration::from_millis(5),
            BTreeMap::new(),
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::EndpointConnected);
        assert_eq!(event.duration, Some(Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn drops_are_counted_and_reported_on_recovery() {
        let bus = DefaultEventBus::new();

        // No subscriber attached yet.
        bus.publish(Event::endpoint_disconnected(None, BTreeMap::new()));
        bus.publish(Event::endpoint_disconnected(None, BTreeMap::new()));
        assert_eq!(bus.dropped_events(), 2);

        let mut rx = bus.subscribe();
        bus.publish(Event::endpoint_disconnected(None, BTreeMap::new()));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::EndpointDisconnected);
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.kind, EventKind::EventsDropped);
        assert!(notice.description.contains("2 events dropped"));
        assert_eq!(bus.dropped_events(), 0);
    }
}
