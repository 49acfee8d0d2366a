use loom_core::ControlMessage;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, Weak,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Fan-out of control events to every connected tab.
///
/// Each subscriber owns a bounded queue. `publish` never blocks: a closed
/// queue is pruned, and a full one marks a slow consumer that gets dropped
/// (its receiver drains what it has, then sees the end of the stream).
#[derive(Clone)]
pub struct ControlBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    counter: AtomicU64,
    capacity: usize,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<ControlMessage>>>>,
}

impl BusInner {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<Arc<ControlMessage>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct BusSubscription {
    id: u64,
    rx: mpsc::Receiver<Arc<ControlMessage>>,
    bus: Weak<BusInner>,
}

impl BusSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Arc<ControlMessage>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<ControlMessage>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers().remove(&self.id);
        }
    }
}

impl ControlBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                counter: AtomicU64::new(0),
                capacity: capacity.max(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> BusSubscription {
        let id = self.inner.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.subscribers().insert(id, tx);
        debug!(event = "bus_subscribe", subscriber = id);
        BusSubscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.inner.subscribers().remove(&id).is_some();
        if removed {
            debug!(event = "bus_unsubscribe", subscriber = id);
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Delivers `msg` to every current subscriber; returns how many got it.
    pub fn publish(&self, msg: ControlMessage) -> usize {
        let kind = msg.kind();
        let msg = Arc::new(msg);
        let targets: Vec<(u64, mpsc::Sender<Arc<ControlMessage>>)> = self
            .inner
            .subscribers()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(id),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "bus_slow_consumer", subscriber = id, kind = kind);
                    dropped.push(id);
                }
            }
        }

        if !dropped.is_empty() {
            let mut subscribers = self.inner.subscribers();
            for id in dropped {
                subscribers.remove(&id);
            }
        }
        debug!(event = "bus_publish", kind = kind, delivered = delivered);
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::FileEventKind;

    fn changed(path: &str) -> ControlMessage {
        ControlMessage::FileChanged {
            event: FileEventKind::Changed,
            path: path.to_string(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_in_order() {
        let bus = ControlBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(changed("one")), 2);
        assert_eq!(bus.publish(changed("two")), 2);

        for sub in [&mut a, &mut b] {
            assert_eq!(*sub.recv().await.expect("first"), changed("one"));
            assert_eq!(*sub.recv().await.expect("second"), changed("two"));
        }
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_without_disturbing_others() {
        let bus = ControlBus::new(8);
        let gone = bus.subscribe();
        let mut stays = bus.subscribe();
        drop(gone);

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.publish(changed("x")), 1);
        assert_eq!(*stays.recv().await.expect("delivered"), changed("x"));
    }

    #[tokio::test]
    async fn closed_receiver_is_removed_on_publish() {
        let bus = ControlBus::new(8);
        let mut sub = bus.subscribe();
        sub.rx.close();

        assert_eq!(bus.publish(changed("x")), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_consumer_is_dropped_after_its_queue_fills() {
        let bus = ControlBus::new(2);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        bus.publish(changed("1"));
        bus.publish(changed("2"));
        assert_eq!(fast.recv().await.expect("1").kind(), "file-changed");
        assert_eq!(fast.recv().await.expect("2").kind(), "file-changed");
        bus.publish(changed("3"));

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(*fast.recv().await.expect("3"), changed("3"));
        assert_eq!(*slow.recv().await.expect("queued 1"), changed("1"));
        assert_eq!(*slow.recv().await.expect("queued 2"), changed("2"));
        assert!(slow.recv().await.is_none());
    }

    #[test]
    fn explicit_unsubscribe_is_idempotent() {
        let bus = ControlBus::new(4);
        let sub = bus.subscribe();
        assert!(bus.unsubscribe(sub.id()));
        assert!(!bus.unsubscribe(sub.id()));
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
