use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};

use crate::store::{ns, Kv, KvSerde, MemKv};

/// The durable queue jobs travel through: the daemon pushes to the task
/// queue and pops from the results queue; workers do the reverse.
#[async_trait]
pub trait Queue: Send + Sync + 'static {
    /// Append `payload` to `queue`.
    async fn push(&self, queue: &str, payload: Vec<u8>) -> Result<()>;
    /// Take the oldest payload from `queue`, waiting up to `wait` for one to
    /// show up. `Ok(None)` means the wait elapsed.
    async fn pop(&self, queue: &str, wait: Duration) -> Result<Option<Vec<u8>>>;
    /// Number of payloads currently in `queue`.
    fn len(&self, queue: &str) -> Result<usize>;
}

#[derive(Serialize, Deserialize, Default, Clone, Copy)]
struct Cursor {
    head: u64,
    tail: u64,
}

/// FIFO queues stored in a [`Kv`]: each item lives at `queue:{name}:{seq}`
/// and `queue:{name}:cursor` tracks the head and tail sequence numbers.
pub struct KvQueue<K: Kv> {
    kv: K,
    lock: Mutex<()>,
    notify: Arc<Notify>,
    poll: Duration,
}

/// In-memory queue for tests and single-process setups.
pub type MemQueue = KvQueue<MemKv>;

/// How often a waiting pop re-checks the KV for items pushed by another
/// process.
pub const DEFAULT_POLL: Duration = Duration::from_millis(100);

impl MemQueue {
    /// Empty in-memory queue.
    pub fn in_memory() -> Self {
        KvQueue::new(MemKv::default())
    }
}

impl<K: Kv> KvQueue<K> {
    /// Queue over `kv` with the default poll interval.
    pub fn new(kv: K) -> Self {
        Self::with_poll(kv, DEFAULT_POLL)
    }

    /// Queue over `kv` re-checking every `poll` while waiting.
    pub fn with_poll(kv: K, poll: Duration) -> Self {
        Self { kv, lock: Mutex::new(()), notify: Arc::new(Notify::new()), poll }
    }

    fn cursor_key(queue: &str) -> Vec<u8> {
        ns("queue", &format!("{queue}:cursor"))
    }

    fn item_key(queue: &str, seq: u64) -> Vec<u8> {
        ns("queue", &format!("{queue}:{seq:020}"))
    }

    fn cursor(&self, queue: &str) -> Result<Cursor> {
        Ok(self.kv.get_t(&Self::cursor_key(queue))?.unwrap_or_default())
    }

    fn lock_name(queue: &str) -> String {
        format!("queue:{queue}")
    }

    // Cursor updates hold both the in-process mutex and the store's lock, so
    // other processes sharing the store never reuse a sequence number.
    fn push_now(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let _g = self.lock.lock();
        self.kv.with_lock(&Self::lock_name(queue), || {
            let mut cur = self.cursor(queue)?;
            self.kv.put(&Self::item_key(queue, cur.tail), payload)
                .with_context(|| format!("push to {queue}"))?;
            cur.tail += 1;
            self.kv.put_t(&Self::cursor_key(queue), &cur)
        })
    }

    fn try_pop(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let _g = self.lock.lock();
        self.kv.with_lock(&Self::lock_name(queue), || {
            let mut cur = self.cursor(queue)?;
            while cur.head < cur.tail {
                let key = Self::item_key(queue, cur.head);
                let item = self.kv.get(&key);
                self.kv.delete(&key);
                cur.head += 1;
                if let Some(item) = item {
                    self.kv.put_t(&Self::cursor_key(queue), &cur)?;
                    return Ok(Some(item));
                }
            }
            Ok(None)
        })
    }
}

#[async_trait]
impl<K: Kv> Queue for KvQueue<K> {
    async fn push(&self, queue: &str, payload: Vec<u8>) -> Result<()> {
        self.push_now(queue, &payload)?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, queue: &str, wait: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + wait;
        loop {
            // Arm before checking so a push in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop(queue)? {
                return Ok(Some(item));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = (deadline - now).min(self.poll);
            let _ = timeout(nap, notified).await;
        }
    }

    fn len(&self, queue: &str) -> Result<usize> {
        let _g = self.lock.lock();
        let cur = self.cursor(queue)?;
        Ok((cur.tail - cur.head) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_default;

    #[tokio::test]
    async fn fifo_per_queue() {
        let q = MemQueue::in_memory();
        q.push("task_queue", b"one".to_vec()).await.unwrap();
        q.push("task_queue", b"two".to_vec()).await.unwrap();
        q.push("task_results", b"r".to_vec()).await.unwrap();
        assert_eq!(q.len("task_queue").unwrap(), 2);

        let wait = Duration::from_millis(10);
        assert_eq!(q.pop("task_queue", wait).await.unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(q.pop("task_queue", wait).await.unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(q.pop("task_queue", wait).await.unwrap(), None);
        assert_eq!(q.len("task_results").unwrap(), 1);
    }

    #[tokio::test]
    async fn pop_times_out_when_empty() {
        let q = MemQueue::in_memory();
        let started = std::time::Instant::now();
        assert!(q.pop("nothing", Duration::from_millis(50)).await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn waiting_pop_wakes_on_push() {
        let q = Arc::new(KvQueue::with_poll(MemKv::default(), Duration::from_secs(10)));
        let popper = {
            let q = q.clone();
            tokio::spawn(async move { q.pop("task_results", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push("task_results", b"done".to_vec()).await.unwrap();

        let got = timeout(Duration::from_secs(1), popper).await.unwrap().unwrap().unwrap();
        assert_eq!(got.as_deref(), Some(&b"done"[..]));
    }

    #[tokio::test]
    async fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = KvQueue::new(open_default(dir.path()).unwrap());
            q.push("task_queue", b"persisted".to_vec()).await.unwrap();
        }
        let q = KvQueue::new(open_default(dir.path()).unwrap());
        assert_eq!(q.len("task_queue").unwrap(), 1);
        let got = q.pop("task_queue", Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"persisted"[..]));
    }

    #[tokio::test]
    async fn handles_sharing_a_directory_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let a = KvQueue::new(open_default(dir.path()).unwrap());
        let b = KvQueue::new(open_default(dir.path()).unwrap());

        std::thread::scope(|scope| {
            for (q, tag) in [(&a, "a"), (&b, "b")] {
                scope.spawn(move || {
                    for i in 0..100 {
                        q.push_now("task_results", format!("{tag}{i}").as_bytes()).unwrap();
                    }
                });
            }
        });

        assert_eq!(a.len("task_results").unwrap(), 200);
        let mut seen = std::collections::HashSet::new();
        while let Some(item) = b.pop("task_results", Duration::from_millis(10)).await.unwrap() {
            seen.insert(item);
        }
        assert_eq!(seen.len(), 200);
    }
}
