use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use ops_core::cfg::SchedulerConfig;
use ops_core::job::{Job, JobEnvelope, JobStatus, WorkerResult};
use ops_core::metrics::Metrics;
use ops_core::queue::Queue;
use ops_core::schedule::{Schedule, ScheduleError};
use ops_core::store::Store;

use crate::module::{stopped, Module, ModuleCtx};
use crate::tracker::WorkerStatusTracker;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid schedule for job {id}: {source}")]
    Schedule {
        id: String,
        #[source]
        source: ScheduleError,
    },
    #[error("persist job {id}: {cause:#}")]
    Persist { id: String, cause: anyhow::Error },
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick: Duration,
    pub result_wait: Duration,
    pub task_queue: String,
    pub result_queue: String,
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(c: &SchedulerConfig) -> Self {
        Self {
            tick: Duration::from_millis(c.tick_ms.max(1)),
            result_wait: Duration::from_millis(c.result_wait_ms.max(1)),
            task_queue: c.task_queue.clone(),
            result_queue: c.result_queue.clone(),
        }
    }
}

struct Trigger {
    schedule: Schedule,
    next_fire: Option<DateTime<Utc>>,
}

struct Entry {
    job: Job,
    trigger: Option<Trigger>,
    // Bumped on every AddTask so an in-flight push for a replaced job
    // cannot mark the new one queued.
    revision: u64,
    // Bumped on every applied worker result; a push only marks the job
    // queued if no result landed while it was in flight.
    results: u64,
}

/// Which version of an entry a trigger was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    revision: u64,
    results: u64,
}

impl Entry {
    fn stamp(&self) -> Stamp {
        Stamp { revision: self.revision, results: self.results }
    }
}

struct Inner {
    table: Mutex<HashMap<String, Entry>>,
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    metrics: Arc<Metrics>,
    opts: SchedulerOptions,
    revisions: AtomicU64,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns the in-memory job table and the recurring triggers. Cheap to clone.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn Queue>, metrics: Arc<Metrics>, opts: SchedulerOptions) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(HashMap::new()),
                store,
                queue,
                metrics,
                opts,
                revisions: AtomicU64::new(0),
                started: AtomicBool::new(false),
                stop_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register or replace a job. A recurring job gets exactly one trigger,
    /// keyed by id. Nothing is touched when the schedule is malformed.
    pub fn add_task(&self, mut job: Job) -> Result<Job, SchedulerError> {
        if job.id.trim().is_empty() {
            job.id = uuid::Uuid::new_v4().to_string();
        }
        let trigger = if job.is_recurring() {
            let schedule = Schedule::parse(&job.schedule)
                .map_err(|source| SchedulerError::Schedule { id: job.id.clone(), source })?;
            let next_fire = schedule.next_after(Utc::now());
            Some(Trigger { schedule, next_fire })
        } else {
            None
        };
        job.status = JobStatus::Created;

        let revision = self.inner.revisions.fetch_add(1, Ordering::Relaxed) + 1;
        let replaced = {
            let mut table = self.inner.table.lock();
            table
                .insert(job.id.clone(), Entry { job: job.clone(), trigger, revision, results: 0 })
                .is_some()
        };
        info!("task added id={} name={} schedule={:?} replaced={}", job.id, job.name, job.schedule, replaced);

        self.inner
            .store
            .upsert_job(&job)
            .map_err(|cause| SchedulerError::Persist { id: job.id.clone(), cause })?;
        self.inner.metrics.jobs_added.inc();
        Ok(job)
    }

    /// Drop a job and its trigger, and delete the stored copy.
    pub fn remove_task(&self, id: &str) -> Result<bool, SchedulerError> {
        let existed = self.inner.table.lock().remove(id).is_some();
        let stored = self
            .inner
            .store
            .delete_job(id)
            .map_err(|cause| SchedulerError::Persist { id: id.to_string(), cause })?;
        if existed {
            info!("task removed id={}", id);
        }
        Ok(existed || stored)
    }

    /// Snapshot of every known job, oldest first.
    pub fn get_tasks(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.table.lock().values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub fn get_task(&self, id: &str) -> Option<Job> {
        self.inner.table.lock().get(id).map(|e| e.job.clone())
    }

    pub fn active_triggers(&self) -> usize {
        self.inner.table.lock().values().filter(|e| e.trigger.is_some()).count()
    }

    /// Reload persisted jobs into the table, re-registering their triggers.
    pub fn restore(&self) -> anyhow::Result<usize> {
        let jobs = self.inner.store.jobs()?;
        let now = Utc::now();
        let mut table = self.inner.table.lock();
        for job in &jobs {
            let trigger = if job.is_recurring() {
                match Schedule::parse(&job.schedule) {
                    Ok(schedule) => {
                        let next_fire = schedule.next_after(now);
                        Some(Trigger { schedule, next_fire })
                    }
                    Err(e) => {
                        warn!("restore job id={} without trigger: {}", job.id, e);
                        None
                    }
                }
            } else {
                None
            };
            let revision = self.inner.revisions.fetch_add(1, Ordering::Relaxed) + 1;
            table.insert(job.id.clone(), Entry { job: job.clone(), trigger, revision, results: 0 });
        }
        info!("restored {} tasks", jobs.len());
        Ok(jobs.len())
    }

    /// Push a known job onto the task queue right away.
    pub async fn enqueue_now(&self, id: &str) -> Option<bool> {
        let (job, stamp) = {
            let table = self.inner.table.lock();
            let e = table.get(id)?;
            (e.job.clone(), e.stamp())
        };
        Some(self.trigger(job, stamp).await)
    }

    /// Fire every trigger due at `now`. Returns how many were fired.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<(Job, Stamp)> = {
            let mut table = self.inner.table.lock();
            table
                .values_mut()
                .filter_map(|e| {
                    let t = e.trigger.as_mut()?;
                    if t.next_fire? > now {
                        return None;
                    }
                    t.next_fire = t.schedule.next_after(now);
                    Some((e.job.clone(), e.stamp()))
                })
                .collect()
        };
        let fired = due.len();
        for (job, stamp) in due {
            self.trigger(job, stamp).await;
        }
        fired
    }

    /// Serialize and push one job; mark it queued on success. A failed push
    /// is logged and dropped until the next firing.
    async fn trigger(&self, job: Job, stamp: Stamp) -> bool {
        info!("executing task id={} name={}", job.id, job.name);
        let payload = match JobEnvelope::plain(job.clone()).to_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("serialize task id={} err={}", job.id, e);
                return false;
            }
        };
        if let Err(e) = self.inner.queue.push(&self.inner.opts.task_queue, payload).await {
            self.inner.metrics.queue_push_failures.inc();
            warn!("failed to queue task id={} err={:#}", job.id, e);
            return false;
        }
        self.inner.metrics.jobs_queued.inc();

        let updated = {
            let mut table = self.inner.table.lock();
            match table.get_mut(&job.id) {
                Some(e) if e.stamp() == stamp => {
                    e.job.status = JobStatus::Queued;
                    Some(e.job.clone())
                }
                _ => None,
            }
        };
        match updated {
            Some(job) => {
                if let Err(e) = self.inner.store.upsert_job(&job) {
                    warn!("persist queued task id={} err={:#}", job.id, e);
                }
            }
            None => debug!("task id={} replaced, removed or reported on while queueing", job.id),
        }
        true
    }

    /// Apply a worker result. Unknown ids and statuses are ignored.
    pub fn apply_result(&self, result: &WorkerResult) -> bool {
        let status: JobStatus = match result.status.parse() {
            Ok(s) => s,
            Err(e) => {
                self.inner.metrics.results_ignored.inc();
                debug!("ignore result task_id={}: {}", result.task_id, e);
                return false;
            }
        };
        let updated = {
            let mut table = self.inner.table.lock();
            table.get_mut(&result.task_id).map(|e| {
                e.job.status = status;
                e.results += 1;
                e.job.clone()
            })
        };
        let Some(job) = updated else {
            self.inner.metrics.results_ignored.inc();
            debug!("ignore result for unknown task_id={}", result.task_id);
            return false;
        };
        self.inner.metrics.results_applied.inc();
        info!("task id={} -> {}", job.id, status);
        if let Err(e) = self.inner.store.upsert_job(&job) {
            warn!("persist task status id={} err={:#}", job.id, e);
        }
        true
    }

    /// Start the trigger loop and the result reconciliation loop.
    pub fn start(&self) {
        if *self.inner.stop_tx.borrow() || self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let triggers = tokio::spawn(self.clone().run_triggers(self.inner.stop_tx.subscribe()));
        let tracker = WorkerStatusTracker::new(
            self.clone(),
            self.inner.queue.clone(),
            self.inner.opts.result_queue.clone(),
            self.inner.opts.result_wait,
        );
        let results = tokio::spawn(tracker.run(self.inner.stop_tx.subscribe()));
        self.inner.tasks.lock().extend([triggers, results]);
        info!("scheduler started tick={:?}", self.inner.opts.tick);
    }

    /// Stop both loops and wait for them. Idempotent.
    pub async fn stop(&self) {
        self.inner.stop_tx.send_replace(true);
        let handles = std::mem::take(&mut *self.inner.tasks.lock());
        for h in handles {
            if let Err(e) = h.await {
                warn!("scheduler loop ended abnormally: {}", e);
            }
        }
    }

    async fn run_triggers(self, mut stop: watch::Receiver<bool>) {
        let mut tick = interval(self.inner.opts.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.fire_due(Utc::now()).await;
                }
                _ = stopped(&mut stop) => break,
            }
        }
        info!("scheduler stopping");
    }
}

impl Module for TaskScheduler {
    fn name(&self) -> &'static str { "scheduler" }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            self.start();
            stopped(&mut ctx.shutdown).await;
            self.stop().await;
            Ok(())
        })
    }
}
