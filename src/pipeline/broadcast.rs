// src/pipeline/broadcast.rs
//
// Pushes every new snapshot to the connected WebSocket sessions. A
// subscriber whose queue is full or closed is removed on the spot and
// never retried.

use crate::pipeline::MonitorMetrics;
use crate::types::Snapshot;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Arc<Snapshot>>,
}

pub struct SnapshotBroadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
    metrics: Option<MonitorMetrics>,
}

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Arc<Snapshot>>,
}

impl SnapshotBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MonitorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { id, tx });
        debug!("Subscriber {} connected", id);
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.id != id);
        debug!("Subscriber {} disconnected", id);
    }

    /// Deliver to every subscriber without blocking. Returns how many
    /// subscribers received the snapshot.
    pub fn publish(&self, snapshot: Arc<Snapshot>) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();

        subscribers.retain(|s| match s.tx.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Subscriber {} is not keeping up, dropping it", s.id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });

        let dropped = (before - subscribers.len()) as u64;
        if let Some(metrics) = &self.metrics {
            metrics.add(&metrics.subscribers_dropped, dropped);
        }
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for SnapshotBroadcaster {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SpotRuntimeState;

    fn snapshot(occupied: bool) -> Arc<Snapshot> {
        let mut s = Snapshot::new();
        s.insert(
            "A1".to_string(),
            SpotRuntimeState {
                occupied,
                ..Default::default()
            },
        );
        Arc::new(s)
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let broadcaster = SnapshotBroadcaster::new(4);
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        assert_eq!(broadcaster.publish(snapshot(true)), 2);
        assert!(a.rx.recv().await.unwrap()["A1"].occupied);
        assert!(b.rx.recv().await.unwrap()["A1"].occupied);
    }

    #[test]
    fn test_failed_subscribers_are_dropped() {
        let metrics = MonitorMetrics::new();
        let broadcaster = SnapshotBroadcaster::new(1).with_metrics(metrics.clone());

        let closed = broadcaster.subscribe();
        drop(closed.rx);
        let _slow = broadcaster.subscribe();
        let mut healthy = broadcaster.subscribe();

        assert_eq!(broadcaster.publish(snapshot(true)), 2);
        healthy.rx.try_recv().unwrap();

        // _slow never drains its single-slot queue
        assert_eq!(broadcaster.publish(snapshot(false)), 1);
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(metrics.summary().subscribers_dropped, 2);
        assert!(!healthy.rx.try_recv().unwrap()["A1"].occupied);
    }

    #[test]
    fn test_unsubscribe() {
        let broadcaster = SnapshotBroadcaster::new(4);
        let sub = broadcaster.subscribe();
        broadcaster.unsubscribe(sub.id);
        assert_eq!(broadcaster.publish(snapshot(true)), 0);
    }
}
