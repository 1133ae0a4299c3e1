//! Topic fanout for push events.
//!
//! The bus maps topic names to subscriber lists. Each inbound invocation is
//! handed to exactly the subscribers of its topic, in registration order.
//! Nothing is buffered: a subscriber sees only what arrives after it
//! registered.
//!
//! Two ways to listen:
//! - [`EventBus::on`] registers a raw callback on a topic name.
//! - [`EventBus::subscribe`] returns an [`EventStream`] of a typed event;
//!   each stream has its own unbounded queue, so a slow consumer never
//!   delays another.
//!
//! Dispatch snapshots the subscriber list and calls handlers without
//! holding the registry lock, so handlers may subscribe or unsubscribe.

pub mod types;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

pub use types::{
    DashboardUpdate, NotificationCategory, NotificationRecord, ProcessingComplete,
    ProcessingProgress,
};

/// A push payload bound to a fixed topic name.
pub trait PushEvent: DeserializeOwned + Send + 'static {
    /// Wire name of the topic.
    const TOPIC: &'static str;
}

/// Handle returned by [`EventBus::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<String, Vec<(SubscriptionId, Handler)>>,
}

/// Topic-keyed publish/subscribe hub. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<RwLock<Registry>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let mut topics: Vec<(&str, usize)> = registry
            .topics
            .iter()
            .map(|(topic, subs)| (topic.as_str(), subs.len()))
            .collect();
        topics.sort_unstable();
        f.debug_struct("EventBus").field("topics", &topics).finish()
    }
}

impl EventBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `handler` for every payload published on `topic`.
    pub fn on(
        &self,
        topic: impl Into<String>,
        handler: impl Fn(&serde_json::Value) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry
            .topics
            .entry(topic.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        registry.topics.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|(sub_id, _)| *sub_id != id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    /// Typed stream of every future `E` event.
    pub fn subscribe<E: PushEvent>(&self) -> EventStream<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on(E::TOPIC, move |payload| {
            match serde_json::from_value::<E>(payload.clone()) {
                Ok(event) => {
                    // Receiver dropped; the stream's Drop unregisters us
                    let _ = tx.send(event);
                }
                Err(e) => log::warn!("[Events] Dropping malformed {} payload: {}", E::TOPIC, e),
            }
        });
        EventStream {
            rx,
            id,
            bus: self.clone(),
        }
    }

    /// Deliver `payload` to the subscribers of `topic`. Returns how many
    /// subscribers were called.
    pub fn dispatch(&self, topic: &str, payload: &serde_json::Value) -> usize {
        let handlers: Vec<Handler> = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            match registry.topics.get(topic) {
                Some(subs) => subs.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => Vec::new(),
            }
        };

        if handlers.is_empty() {
            log::trace!("[Events] No subscribers for {}", topic);
        }
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }
}

/// Typed, ordered stream of one topic. Unsubscribes on drop.
pub struct EventStream<E> {
    rx: mpsc::UnboundedReceiver<E>,
    id: SubscriptionId,
    bus: EventBus,
}

impl<E> std::fmt::Debug for EventStream<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<E> EventStream<E> {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

impl<E> futures_util::Stream for EventStream<E> {
    type Item = E;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<E> Drop for EventStream<E> {
    fn drop(&mut self) {
        self.bus.off(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_topic_isolation() {
        let bus = EventBus::new();
        let mut progress = bus.subscribe::<ProcessingProgress>();
        let mut complete = bus.subscribe::<ProcessingComplete>();

        bus.dispatch(
            "ProcessingComplete",
            &json!({"documentId": "doc-1", "success": true, "timestamp": "2026-01-05T10:00:00Z"}),
        );

        assert!(progress.try_recv().is_none());
        let event = complete.try_recv().unwrap();
        assert_eq!(event.document_id, "doc-1");
        assert!(complete.try_recv().is_none());
    }

    #[test]
    fn test_order_is_preserved_per_subscriber() {
        let bus = EventBus::new();
        let mut first = bus.subscribe::<DashboardUpdate>();
        let mut second = bus.subscribe::<DashboardUpdate>();

        for minute in 10..13 {
            bus.dispatch(
                "DashboardUpdate",
                &json!({"timestamp": format!("2026-01-05T10:{minute}:00Z")}),
            );
        }

        for stream in [&mut first, &mut second] {
            let minutes: Vec<String> = std::iter::from_fn(|| stream.try_recv())
                .map(|u| u.timestamp.format("%M").to_string())
                .collect();
            assert_eq!(minutes, vec!["10", "11", "12"]);
        }
    }

    #[test]
    fn test_late_subscriber_gets_no_replay() {
        let bus = EventBus::new();
        bus.dispatch("DashboardUpdate", &json!({"timestamp": "2026-01-05T10:00:00Z"}));

        let mut late = bus.subscribe::<DashboardUpdate>();
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn test_malformed_payload_does_not_affect_others() {
        let bus = EventBus::new();
        let mut typed = bus.subscribe::<ProcessingComplete>();
        let raw_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&raw_calls);
        bus.on("ProcessingComplete", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.dispatch("ProcessingComplete", &json!({"unexpected": 1})), 2);
        assert!(typed.try_recv().is_none());
        assert_eq!(raw_calls.load(Ordering::SeqCst), 1);

        bus.dispatch(
            "ProcessingComplete",
            &json!({"documentId": "d", "success": false, "timestamp": "2026-01-05T10:00:00"}),
        );
        assert!(!typed.try_recv().unwrap().success);
    }

    #[test]
    fn test_dropped_stream_unsubscribes() {
        let bus = EventBus::new();
        let stream = bus.subscribe::<DashboardUpdate>();
        assert_eq!(bus.dispatch("DashboardUpdate", &json!({})), 1);

        drop(stream);
        assert_eq!(bus.dispatch("DashboardUpdate", &json!({})), 0);
    }

    #[test]
    fn test_off() {
        let bus = EventBus::new();
        let id = bus.on("Notification", |_| {});
        assert!(bus.off(id));
        assert!(!bus.off(id));
    }

    #[test]
    fn test_handler_may_unsubscribe_itself() {
        let bus = EventBus::new();
        let slot: Arc<std::sync::Mutex<Option<SubscriptionId>>> = Arc::default();
        let inner_bus = bus.clone();
        let inner_slot = Arc::clone(&slot);
        let id = bus.on("Notification", move |_| {
            if let Some(id) = inner_slot.lock().unwrap().take() {
                inner_bus.off(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        assert_eq!(bus.dispatch("Notification", &json!({})), 1);
        assert_eq!(bus.dispatch("Notification", &json!({})), 0);
    }
}
