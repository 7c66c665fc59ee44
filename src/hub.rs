/// Publish/subscribe fan-out of log records to live viewers.
///
/// Every subscriber gets its own bounded channel. `publish` never waits: a
/// full channel drops the new record for that subscriber only, and a closed
/// channel removes the subscriber on the spot.
use crate::record::Envelope;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};

pub type SubscriberId = u64;

pub struct Hub {
    inner: Mutex<HubInner>,
    buffer: usize,
}

struct HubInner {
    next_id: SubscriberId,
    subscribers: BTreeMap<SubscriberId, Slot>,
}

struct Slot {
    tx: mpsc::Sender<Envelope>,
    /// Seq of the last record handed to this subscriber's channel.
    last_seq: u64,
    dropped: u64,
}

/// What happened during one publish.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberInfo {
    pub id: SubscriberId,
    pub last_seq: u64,
    pub dropped: u64,
}

impl Hub {
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner {
                next_id: 1,
                subscribers: BTreeMap::new(),
            }),
            buffer: buffer.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new subscriber. Dropping the returned handle unsubscribes.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(
            id,
            Slot {
                tx,
                last_seq: 0,
                dropped: 0,
            },
        );
        tracing::debug!(subscriber = id, total = inner.subscribers.len(), "subscriber joined");

        Subscription {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.lock();
        let removed = inner.subscribers.remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber = id, total = inner.subscribers.len(), "subscriber left");
        }
        removed
    }

    /// Hand `envelope` to every subscriber without waiting on any of them.
    pub fn publish(&self, envelope: &Envelope) -> PublishReport {
        let mut report = PublishReport::default();
        let mut inner = self.lock();

        inner.subscribers.retain(|id, slot| match slot.tx.try_send(envelope.clone()) {
            Ok(()) => {
                slot.last_seq = envelope.seq;
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                slot.dropped += 1;
                report.dropped += 1;
                if slot.dropped == 1 || slot.dropped % 100 == 0 {
                    tracing::warn!(
                        subscriber = *id,
                        dropped = slot.dropped,
                        "subscriber buffer full, dropping records"
                    );
                }
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = *id, "subscriber channel closed, removing");
                report.removed += 1;
                false
            }
        });

        report
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        self.lock()
            .subscribers
            .iter()
            .map(|(id, slot)| SubscriberInfo {
                id: *id,
                last_seq: slot.last_seq,
                dropped: slot.dropped,
            })
            .collect()
    }
}

/// Receiving end of one subscriber.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Envelope>,
    hub: Weak<Hub>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next record in publish order; `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryRing;
    use crate::parser::parse_line;

    fn envelopes(n: usize) -> Vec<Envelope> {
        let mut ring = HistoryRing::new(n.max(1));
        (0..n)
            .map(|i| ring.push(parse_line(&format!("INFO: record {i}")).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_in_order() {
        let hub = Hub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        for env in envelopes(3) {
            assert_eq!(hub.publish(&env).delivered, 2);
        }

        for sub in [&mut a, &mut b] {
            let seqs: Vec<u64> = vec![
                sub.recv().await.unwrap().seq,
                sub.recv().await.unwrap().seq,
                sub.recv().await.unwrap().seq,
            ];
            assert_eq!(seqs, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_stalled_subscriber_does_not_affect_others() {
        let hub = Hub::new(2);
        let _stalled = hub.subscribe();
        let mut healthy = hub.subscribe();

        let mut received = Vec::new();
        for env in envelopes(5) {
            let report = hub.publish(&env);
            assert_eq!(report.removed, 0);
            received.push(healthy.recv().await.unwrap().seq);
        }
        assert_eq!(received, vec![1, 2, 3, 4, 5]);

        let infos = hub.subscribers();
        let stalled_info = infos.iter().find(|i| i.id != healthy.id()).unwrap();
        assert_eq!(stalled_info.dropped, 3);
        assert_eq!(stalled_info.last_seq, 2);
        let healthy_info = infos.iter().find(|i| i.id == healthy.id()).unwrap();
        assert_eq!(healthy_info.dropped, 0);
        assert_eq!(healthy_info.last_seq, 5);
    }

    #[tokio::test]
    async fn test_overflow_drops_newest_keeps_buffered() {
        let hub = Hub::new(2);
        let mut sub = hub.subscribe();
        let envs = envelopes(4);
        for env in &envs {
            hub.publish(env);
        }
        assert_eq!(sub.recv().await.unwrap().seq, 1);
        assert_eq!(sub.recv().await.unwrap().seq, 2);
        assert!(sub.rx.try_recv().is_err());
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let hub = Hub::new(4);
        let a = hub.subscribe();
        let b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);
        drop(a);
        assert_eq!(hub.subscriber_count(), 1);
        assert!(!hub.unsubscribe(999));
        assert!(hub.unsubscribe(b.id()));
        assert_eq!(hub.subscriber_count(), 0);
        // Dropping after an explicit unsubscribe is harmless.
        drop(b);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_closed_channel_is_removed_on_next_publish() {
        let hub = Hub::new(4);
        // A receiver that vanished without unsubscribing.
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        hub.lock().subscribers.insert(
            42,
            Slot {
                tx,
                last_seq: 0,
                dropped: 0,
            },
        );
        let _live = hub.subscribe();

        let report = hub.publish(&envelopes(1)[0]);
        assert_eq!(report.removed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert!(!hub.unsubscribe(42));
    }
}
