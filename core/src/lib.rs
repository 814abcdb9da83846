#![deny(missing_docs)]
//! ops_core: shared building blocks (config, KV, queue, logging, job and alert
//! types, resilience primitives).

/// Configuration helpers (AppId, dirs, load_or_init, etc.)
pub mod cfg;
/// Simple file-backed KV store with serde helpers, plus the job/alert store.
pub mod store;
/// Durable FIFO queue used to hand jobs to workers and collect results.
pub mod queue;
/// Tracing/log initialization helpers.
pub mod logx;
/// Shared job model used by scheduler, web, and tools.
pub mod job;
/// Recurrence expressions (`@every 5m`, cron).
pub mod schedule;
/// Alerts and severity classification.
pub mod alert;
/// Explicitly constructed counters registry.
pub mod metrics;
/// Call-wrapping circuit breaker.
pub mod breaker;
/// Per-key token-bucket rate limiter.
pub mod limiter;
