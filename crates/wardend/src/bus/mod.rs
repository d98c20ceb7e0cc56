//! In-process publish/subscribe event bus.
//!
//! - `publish` never blocks: a subscriber whose queue is full misses the
//!   event, the publisher and the other subscribers carry on.
//! - Each subscriber has its own bounded queue, so delivery order per
//!   subscriber is publish order.
//! - A subscription matches an [`EventKind`] and an exact-match AND over its
//!   filter labels.

mod event;

pub use event::{Event, EventKind};

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use warden_common::constants::labels;

/// A `key=value` pair attached to a published event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label {
    pub key: &'static str,
    pub value: String,
}

impl Label {
    pub fn new(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    pub fn path(path: impl ToString) -> Self {
        Self::new(labels::PATH, path.to_string())
    }

    pub fn node(node: impl Into<String>) -> Self {
        Self::new(labels::NODE, node)
    }
}

struct Subscriber {
    id: u64,
    name: String,
    kind: EventKind,
    filter: Vec<Label>,
    tx: mpsc::Sender<Event>,
    dropped: AtomicU64,
}

impl Subscriber {
    fn matches(&self, kind: EventKind, labels: &[Label]) -> bool {
        self.kind == kind && self.filter.iter().all(|f| labels.contains(f))
    }
}

struct BusInner {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    queue_size: usize,
}

impl BusInner {
    fn unregister(&self, id: u64) {
        self.subscribers.write().retain(|s| s.id != id);
    }
}

/// Cloneable handle on the bus
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(queue_size: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                queue_size: queue_size.max(1),
            }),
        }
    }

    /// Register a subscriber for `kind` events carrying every `filter` label
    pub fn subscribe(&self, name: impl Into<String>, kind: EventKind, filter: Vec<Label>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.queue_size);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();

        self.inner.subscribers.write().push(Subscriber {
            id,
            name: name.clone(),
            kind,
            filter,
            tx,
            dropped: AtomicU64::new(0),
        });

        tracing::trace!(sub = %name, kind = %kind, "subscribed");

        Subscription {
            id,
            name,
            rx,
            bus: Arc::downgrade(&self.inner),
            stopped: false,
        }
    }

    /// Deliver a copy of `event` to every matching subscriber
    pub fn publish(&self, event: Event, labels: &[Label]) {
        let kind = event.kind();
        let mut closed = Vec::new();
        {
            let subscribers = self.inner.subscribers.read();
            for sub in subscribers.iter().filter(|s| s.matches(kind, labels)) {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::warn!(sub = %sub.name, kind = %kind, dropped, "subscriber queue full, event dropped");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(sub.id),
                }
            }
        }
        for id in closed {
            self.inner.unregister(id);
        }
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

/// A registered subscriber queue, unregistered on `stop` or drop
pub struct Subscription {
    id: u64,
    name: String,
    rx: mpsc::Receiver<Event>,
    bus: Weak<BusInner>,
    stopped: bool,
}

impl Subscription {
    /// Next event; `None` once stopped and drained
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Unregister and discard in-flight events. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(bus) = self.bus.upgrade() {
            bus.unregister(self.id);
        }
        self.rx.close();
        let mut discarded = 0usize;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::trace!(sub = %self.name, discarded, "discarded pending events");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drain `rx` until it stays empty for `timeout`, so senders blocked on a
/// stopping worker are released instead of hanging.
pub async fn drop_pending<T>(rx: &mut mpsc::Receiver<T>, timeout: Duration) -> usize {
    let mut dropped = 0;
    while let Ok(Some(_)) = tokio::time::timeout(timeout, rx.recv()).await {
        dropped += 1;
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_common::ObjectPath;

    fn agg_deleted(name: &str) -> Event {
        Event::ObjectAggDeleted {
            path: ObjectPath::parse(name).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let bus = Bus::new(16);
        let mut a = bus.subscribe("a", EventKind::ObjectAggDeleted, vec![]);
        let mut b = bus.subscribe("b", EventKind::ObjectAggDeleted, vec![]);

        for name in ["s1", "s2", "s3"] {
            bus.publish(agg_deleted(name), &[Label::path(name)]);
        }

        for sub in [&mut a, &mut b] {
            for name in ["s1", "s2", "s3"] {
                assert_eq!(sub.recv().await.unwrap(), agg_deleted(name));
            }
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let bus = Bus::new(2);
        let mut slow = bus.subscribe("slow", EventKind::ObjectAggDeleted, vec![]);
        let mut fast = bus.subscribe("fast", EventKind::ObjectAggDeleted, vec![]);

        for i in 0..5 {
            bus.publish(agg_deleted(&format!("s{i}")), &[]);
            // fast keeps up
            assert_eq!(fast.recv().await.unwrap(), agg_deleted(&format!("s{i}")));
        }

        // slow only kept what fit in its queue, in order
        assert_eq!(slow.recv().await.unwrap(), agg_deleted("s0"));
        assert_eq!(slow.recv().await.unwrap(), agg_deleted("s1"));
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_label_filter_is_exact_and() {
        let bus = Bus::new(8);
        let mut sub = bus.subscribe(
            "web",
            EventKind::ObjectAggDeleted,
            vec![Label::path("web"), Label::node("n1")],
        );

        bus.publish(agg_deleted("web"), &[Label::path("web")]);
        bus.publish(agg_deleted("web"), &[Label::path("web"), Label::node("n2")]);
        bus.publish(agg_deleted("web2"), &[Label::path("web2"), Label::node("n1")]);
        bus.publish(agg_deleted("web"), &[Label::node("n1"), Label::path("web")]);

        assert_eq!(sub.recv().await.unwrap(), agg_deleted("web"));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let bus = Bus::new(8);
        let mut sub = bus.subscribe("x", EventKind::ConfigDeleted, vec![]);
        bus.publish(agg_deleted("web"), &[]);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_unregisters() {
        let bus = Bus::new(8);
        let mut sub = bus.subscribe("x", EventKind::ObjectAggDeleted, vec![]);
        bus.publish(agg_deleted("web"), &[]);
        assert_eq!(bus.subscriber_count(), 1);

        sub.stop();
        sub.stop();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());

        let other = bus.subscribe("y", EventKind::ObjectAggDeleted, vec![]);
        drop(other);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_pending_releases_senders() {
        let (tx, mut rx) = mpsc::channel::<u32>(1);
        let sender = tokio::spawn(async move {
            for i in 0..3 {
                if tx.send(i).await.is_err() {
                    break;
                }
            }
        });
        let dropped = drop_pending(&mut rx, Duration::from_millis(50)).await;
        assert_eq!(dropped, 3);
        sender.await.unwrap();
    }
}
