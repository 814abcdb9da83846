use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Add one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters shared by the daemon's components. Built once in `main` and
/// handed out by `Arc`; there is no global instance.
#[derive(Debug, Default)]
pub struct Metrics {
    /// `AddTask` calls that succeeded.
    pub jobs_added: Counter,
    /// Triggered jobs pushed onto the task queue.
    pub jobs_queued: Counter,
    /// Task-queue pushes that failed.
    pub queue_push_failures: Counter,
    /// Worker results applied to a known job.
    pub results_applied: Counter,
    /// Worker results for unknown ids or with unparseable bodies.
    pub results_ignored: Counter,
    /// Alerts accepted into the pipeline.
    pub alerts_accepted: Counter,
    /// Alerts shed because the pipeline was full.
    pub alerts_dropped: Counter,
    /// Alerts fully handled by the consumer.
    pub alerts_handled: Counter,
    /// Remediation jobs enqueued for critical alerts.
    pub remediations_queued: Counter,
    /// Messages delivered to live subscribers.
    pub broadcasts_sent: Counter,
    /// Subscribers removed after a failed write.
    pub subscribers_pruned: Counter,
    /// Store operations that returned an error.
    pub store_errors: Counter,
    /// Requests rejected by the rate limiter.
    pub rate_limited: Counter,
    /// Calls rejected by the circuit breaker.
    pub breaker_rejections: Counter,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub jobs_added: u64,
    pub jobs_queued: u64,
    pub queue_push_failures: u64,
    pub results_applied: u64,
    pub results_ignored: u64,
    pub alerts_accepted: u64,
    pub alerts_dropped: u64,
    pub alerts_handled: u64,
    pub remediations_queued: u64,
    pub broadcasts_sent: u64,
    pub subscribers_pruned: u64,
    pub store_errors: u64,
    pub rate_limited: u64,
    pub breaker_rejections: u64,
}

impl Metrics {
    /// Fresh registry with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_added: self.jobs_added.get(),
            jobs_queued: self.jobs_queued.get(),
            queue_push_failures: self.queue_push_failures.get(),
            results_applied: self.results_applied.get(),
            results_ignored: self.results_ignored.get(),
            alerts_accepted: self.alerts_accepted.get(),
            alerts_dropped: self.alerts_dropped.get(),
            alerts_handled: self.alerts_handled.get(),
            remediations_queued: self.remediations_queued.get(),
            broadcasts_sent: self.broadcasts_sent.get(),
            subscribers_pruned: self.subscribers_pruned.get(),
            store_errors: self.store_errors.get(),
            rate_limited: self.rate_limited.get(),
            breaker_rejections: self.breaker_rejections.get(),
        }
    }
}
