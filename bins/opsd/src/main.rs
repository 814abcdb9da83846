mod module;
mod monitor;
mod runner;
mod scheduler;
mod tracker;
mod web;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ops_core::cfg::{self, AppId, Config};
use ops_core::logx;
use ops_core::metrics::Metrics;
use ops_core::queue::{KvQueue, Queue};
use ops_core::store::{self, KvStore, Store, Traced};

use module::{Module, ModuleCtx};
use monitor::broadcast::Broadcaster;
use monitor::pipeline::AlertSink;
use monitor::LogMonitor;
use scheduler::{SchedulerOptions, TaskScheduler};

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"),
};

#[derive(Parser)]
#[command(name = "opsd", version, about = "Job scheduling and log alerting daemon")]
struct Cli {
    /// Config file to use instead of the per-user one.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log filter, overriding `log_level` (RUST_LOG still wins).
    #[arg(long)]
    log: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => cfg::load_from(path)?,
        None => cfg::load_or_init(&APP)?,
    };
    logx::init(cli.log.as_deref().unwrap_or(&cfg.log_level), cfg.log_format);
    info!("{} boot", APP.application);

    runtime()?.block_on(run(cfg))
}

#[cfg(feature = "rt-single")]
fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

#[cfg(not(feature = "rt-single"))]
fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(1))
        .enable_all()
        .build()
}

async fn run(cfg: Config) -> Result<()> {
    let data = cfg::data_dir(&APP, &cfg)?;
    info!("data dir {}", data.display());

    let metrics = Arc::new(Metrics::new());
    let store: Arc<dyn Store> = Arc::new(Traced::new(
        KvStore::new(store::open_default(data.join("store"))?),
        metrics.clone(),
    ));
    let queue: Arc<dyn Queue> = Arc::new(KvQueue::new(store::open_default(data.join("queue"))?));

    let scheduler = TaskScheduler::new(
        store.clone(),
        queue.clone(),
        metrics.clone(),
        SchedulerOptions::from(&cfg.scheduler),
    );
    if let Err(e) = scheduler.restore() {
        warn!("restore tasks: {:#}", e);
    }
    for job in cfg.jobs.iter().cloned() {
        let id = job.id.clone();
        if let Err(e) = scheduler.add_task(job) {
            warn!("seed task {}: {}", id, e);
        }
    }

    let sink = AlertSink {
        store: store.clone(),
        queue: queue.clone(),
        broadcaster: Broadcaster::new(metrics.clone()),
        task_queue: cfg.scheduler.task_queue.clone(),
        script: cfg.monitor.remediation_script.clone(),
        metrics: metrics.clone(),
    };
    let monitor = LogMonitor::new(sink, cfg.monitor.alert_capacity, Duration::from_millis(cfg.monitor.poll_ms));
    for w in &cfg.watches {
        if let Err(e) = monitor.watch(&w.path, &w.patterns).await {
            warn!("seed watch {}: {}", w.path, e);
        }
    }

    let mut modules: Vec<Box<dyn Module>> = vec![Box::new(scheduler.clone()), Box::new(monitor.clone())];

    #[cfg(feature = "web-api")]
    {
        use ops_core::breaker::CircuitBreaker;
        use ops_core::limiter::RateLimiter;

        let state = web::AppState {
            scheduler: scheduler.clone(),
            monitor: monitor.clone(),
            store: store.clone(),
            metrics: metrics.clone(),
            breaker: Arc::new(CircuitBreaker::new(cfg.breaker.settings("execute-immediate"))),
            limiter: Arc::new(RateLimiter::new(cfg.limiter.rate_per_sec, cfg.limiter.burst, cfg.limiter.max_keys)),
            runner: runner::Runner::from_config(&cfg.worker),
            started: std::time::Instant::now(),
        };
        modules.push(Box::new(web::WebServer {
            state,
            http_addr: web::parse_addr(cfg.server.http_addr.as_deref())?,
            https_addr: web::parse_addr(cfg.server.https_addr.as_deref())?,
            tls_cert_pem: cfg.server.tls_cert_pem.clone(),
            tls_key_pem: cfg.server.tls_key_pem.clone(),
        }));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = ModuleCtx { shutdown: shutdown_rx };
    let handles: Vec<(&'static str, JoinHandle<Result<()>>)> = modules
        .into_iter()
        .map(|m| {
            let name = m.name();
            info!("module {} starting", name);
            (name, m.spawn(ctx.clone()))
        })
        .collect();

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    info!("shutdown requested");
    shutdown_tx.send_replace(true);

    for (name, h) in handles {
        match h.await {
            Ok(Ok(())) => info!("module {} stopped", name),
            Ok(Err(e)) => warn!("module {} failed: {:#}", name, e),
            Err(e) => warn!("module {} panicked: {}", name, e),
        }
    }
    info!("final counters {:?}", metrics.snapshot());
    Ok(())
}
