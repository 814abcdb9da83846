use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ops_core::alert::Alert;
use ops_core::metrics::Metrics;

/// Frames buffered per subscriber before it counts as stuck.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// One live subscriber: its id (for [`Broadcaster::remove`]) and the
/// serialized alerts addressed to it.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Arc<str>>,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    senders: HashMap<u64, mpsc::Sender<Arc<str>>>,
}

/// Fan-out of alerts to connected subscribers. A subscriber that cannot take
/// a frame (gone, or its buffer is full) is dropped from the set.
#[derive(Clone)]
pub struct Broadcaster {
    subs: Arc<Mutex<Subscribers>>,
    metrics: Arc<Metrics>,
}

impl Broadcaster {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { subs: Arc::new(Mutex::new(Subscribers::default())), metrics }
    }

    pub fn add(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut subs = self.subs.lock();
        subs.next_id += 1;
        let id = subs.next_id;
        subs.senders.insert(id, tx);
        debug!("subscriber {} added ({} total)", id, subs.senders.len());
        Subscription { id, rx }
    }

    pub fn remove(&self, id: u64) -> bool {
        self.subs.lock().senders.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.subs.lock().senders.len()
    }

    /// Send `alert` to every subscriber; returns how many took it.
    pub fn broadcast(&self, alert: &Alert) -> usize {
        let frame: Arc<str> = match serde_json::to_string(alert) {
            Ok(s) => s.into(),
            Err(e) => {
                warn!("serialize alert id={} err={}", alert.id, e);
                return 0;
            }
        };
        let targets: Vec<(u64, mpsc::Sender<Arc<str>>)> =
            self.subs.lock().senders.iter().map(|(id, tx)| (*id, tx.clone())).collect();

        let mut sent = 0;
        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(_) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            let mut subs = self.subs.lock();
            for id in &dead {
                if subs.senders.remove(id).is_some() {
                    self.metrics.subscribers_pruned.inc();
                    debug!("subscriber {} pruned", id);
                }
            }
        }
        for _ in 0..sent {
            self.metrics.broadcasts_sent.inc();
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ops_core::alert::Severity;

    fn alert(msg: &str) -> Alert {
        Alert::new("log_alert", msg, Severity::Warning)
    }

    #[tokio::test]
    async fn every_subscriber_gets_the_frame() {
        let b = Broadcaster::new(Arc::new(Metrics::new()));
        let mut s1 = b.add();
        let mut s2 = b.add();
        assert_ne!(s1.id, s2.id);

        let a = alert("disk warning");
        assert_eq!(b.broadcast(&a), 2);
        for sub in [&mut s1, &mut s2] {
            let frame = sub.rx.recv().await.unwrap();
            let back: Alert = serde_json::from_str(&frame).unwrap();
            assert_eq!(back, a);
        }
    }

    #[tokio::test]
    async fn dead_subscribers_are_pruned() {
        let metrics = Arc::new(Metrics::new());
        let b = Broadcaster::new(metrics.clone());
        let live = b.add();
        let gone = b.add();
        drop(gone);

        assert_eq!(b.broadcast(&alert("one")), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(metrics.subscribers_pruned.get(), 1);
        assert_eq!(b.broadcast(&alert("two")), 1);
        drop(live);
    }

    #[tokio::test]
    async fn stuck_subscriber_is_dropped_and_fifo_kept() {
        let b = Broadcaster::new(Arc::new(Metrics::new()));
        let mut sub = b.add();
        for i in 0..SUBSCRIBER_BUFFER {
            assert_eq!(b.broadcast(&alert(&format!("m{i}"))), 1);
        }
        assert_eq!(b.broadcast(&alert("overflow")), 0);
        assert_eq!(b.len(), 0);

        let first: Alert = serde_json::from_str(&sub.rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.message, "m0");
    }

    #[test]
    fn remove_is_explicit_and_idempotent() {
        let b = Broadcaster::new(Arc::new(Metrics::new()));
        let s = b.add();
        assert!(b.remove(s.id));
        assert!(!b.remove(s.id));
        assert_eq!(b.len(), 0);
    }
}
