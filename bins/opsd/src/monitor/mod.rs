//! Log watching and alert delivery.
//!
//! Each watched file gets its own [`watcher::Tailer`] task. Matches flow
//! through the bounded [`pipeline::AlertPipeline`] into a single consumer that
//! persists, broadcasts and remediates.

pub mod broadcast;
pub mod pipeline;
pub mod watcher;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ops_core::alert::Alert;

use broadcast::{Broadcaster, Subscription};
use pipeline::{AlertConsumer, AlertPipeline, AlertSink};
use watcher::Tailer;

use crate::module::{stopped, Module, ModuleCtx};

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("monitor is stopped")]
    Stopped,
}

struct WatchHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    async fn shutdown(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            warn!("tail task ended abnormally: {}", e);
        }
    }
}

struct Inner {
    watches: Mutex<HashMap<PathBuf, WatchHandle>>,
    pipeline: AlertPipeline,
    consumer: Mutex<Option<AlertConsumer>>,
    consumer_task: Mutex<Option<JoinHandle<()>>>,
    broadcaster: Broadcaster,
    poll: Duration,
    stop_tx: watch::Sender<bool>,
}

/// Owns the watch registry, the alert pipeline and the broadcaster. Cheap to
/// clone.
#[derive(Clone)]
pub struct LogMonitor {
    inner: Arc<Inner>,
}

impl LogMonitor {
    pub fn new(sink: AlertSink, capacity: usize, poll: Duration) -> Self {
        let broadcaster = sink.broadcaster.clone();
        let (pipeline, consumer) = AlertPipeline::channel(capacity, sink);
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                watches: Mutex::new(HashMap::new()),
                pipeline,
                consumer: Mutex::new(Some(consumer)),
                consumer_task: Mutex::new(None),
                broadcaster,
                poll: poll.max(Duration::from_millis(1)),
                stop_tx,
            }),
        }
    }

    fn is_stopped(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }

    /// Start tailing `path` from its current end. Watching a path again
    /// replaces the earlier watch and its patterns; if the reopen fails the
    /// path is left unwatched.
    pub async fn watch(&self, path: &str, patterns: &[String]) -> Result<(), WatchError> {
        if self.is_stopped() {
            return Err(WatchError::Stopped);
        }
        let compiled = patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|source| WatchError::Pattern { pattern: p.clone(), source }))
            .collect::<Result<Vec<_>, _>>()?;

        let key = PathBuf::from(path);
        // The old tail must be gone before the new one seeks, or lines in
        // between are matched twice.
        let previous = self.inner.watches.lock().remove(&key);
        let replaced = previous.is_some();
        if let Some(old) = previous {
            old.shutdown().await;
        }

        let tailer = Tailer::open(&key, compiled, self.inner.poll, self.inner.pipeline.clone())
            .await
            .map_err(|source| WatchError::Open { path: path.to_string(), source })?;
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(tailer.run(stop_rx));

        let raced = self.inner.watches.lock().insert(key.clone(), WatchHandle { stop, task });
        if let Some(other) = raced {
            other.shutdown().await;
        }
        if replaced {
            info!("watch replaced path={} patterns={}", path, patterns.len());
        } else {
            info!("watching path={} patterns={}", path, patterns.len());
        }

        // Lost a race with stop(): undo.
        if self.is_stopped() {
            let handle = self.inner.watches.lock().remove(&key);
            if let Some(h) = handle {
                h.shutdown().await;
            }
            return Err(WatchError::Stopped);
        }
        Ok(())
    }

    /// Stop tailing `path`; `false` if it was not watched.
    pub async fn unwatch(&self, path: &str) -> bool {
        let handle = self.inner.watches.lock().remove(&PathBuf::from(path));
        match handle {
            Some(h) => {
                h.shutdown().await;
                info!("unwatched path={}", path);
                true
            }
            None => false,
        }
    }

    pub fn watched(&self) -> Vec<String> {
        let mut paths: Vec<String> =
            self.inner.watches.lock().keys().map(|p| p.display().to_string()).collect();
        paths.sort();
        paths
    }

    /// Feed an externally created alert into the pipeline.
    pub fn submit(&self, alert: Alert) -> bool {
        self.inner.pipeline.submit(alert)
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.broadcaster.add()
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    /// Start the alert consumer. Tail loops start with each `watch`.
    pub fn start(&self) {
        if self.is_stopped() {
            return;
        }
        let Some(consumer) = self.inner.consumer.lock().take() else {
            return;
        };
        let task = tokio::spawn(consumer.run(self.inner.stop_tx.subscribe()));
        *self.inner.consumer_task.lock() = Some(task);
        info!("monitor started");
    }

    /// Stop every tail loop and the consumer, closing the watched files.
    /// Idempotent.
    pub async fn stop(&self) {
        self.inner.stop_tx.send_replace(true);
        let handles: Vec<WatchHandle> = self.inner.watches.lock().drain().map(|(_, h)| h).collect();
        for h in handles {
            h.shutdown().await;
        }
        let consumer = self.inner.consumer_task.lock().take();
        if let Some(task) = consumer {
            if let Err(e) = task.await {
                warn!("alert consumer ended abnormally: {}", e);
            }
        }
    }
}

impl Module for LogMonitor {
    fn name(&self) -> &'static str { "monitor" }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            self.start();
            stopped(&mut ctx.shutdown).await;
            self.stop().await;
            Ok(())
        })
    }
}
