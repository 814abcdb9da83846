use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use ops_core::alert::Alert;
use ops_core::job::{Job, JobEnvelope, JobStatus};
use ops_core::metrics::Metrics;
use ops_core::queue::Queue;
use ops_core::store::Store;

use super::broadcast::Broadcaster;
use crate::module::stopped;

/// Job kind given to remediation jobs.
pub const ALERT_RESPONSE: &str = "alert_response";

/// Producer side of the alert channel. Never blocks: a full channel sheds
/// the alert.
#[derive(Clone)]
pub struct AlertPipeline {
    tx: mpsc::Sender<Alert>,
    metrics: Arc<Metrics>,
}

/// Everything the consumer hands an alert to.
#[derive(Clone)]
pub struct AlertSink {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn Queue>,
    pub broadcaster: Broadcaster,
    pub task_queue: String,
    pub script: String,
    pub metrics: Arc<Metrics>,
}

/// The single consumer draining the alert channel.
pub struct AlertConsumer {
    rx: mpsc::Receiver<Alert>,
    sink: AlertSink,
}

impl AlertPipeline {
    pub fn channel(capacity: usize, sink: AlertSink) -> (Self, AlertConsumer) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pipeline = Self { tx, metrics: sink.metrics.clone() };
        (pipeline, AlertConsumer { rx, sink })
    }

    /// Offer an alert; `false` if it was dropped.
    pub fn submit(&self, alert: Alert) -> bool {
        match self.tx.try_send(alert) {
            Ok(()) => {
                self.metrics.alerts_accepted.inc();
                true
            }
            Err(mpsc::error::TrySendError::Full(alert)) => {
                self.metrics.alerts_dropped.inc();
                warn!("alert channel full, dropping alert id={} severity={}", alert.id, alert.severity);
                false
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                self.metrics.alerts_dropped.inc();
                debug!("alert pipeline closed, dropping alert id={}", alert.id);
                false
            }
        }
    }
}

impl AlertConsumer {
    #[cfg(test)]
    pub(crate) fn try_next(&mut self) -> Option<Alert> {
        self.rx.try_recv().ok()
    }

    /// Drain until stopped; alerts already buffered at stop are still handled.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                next = self.rx.recv() => match next {
                    Some(alert) => self.sink.handle(alert).await,
                    None => break,
                },
                _ = stopped(&mut stop) => break,
            }
        }
        self.rx.close();
        while let Ok(alert) = self.rx.try_recv() {
            self.sink.handle(alert).await;
        }
        info!("alert consumer stopping");
    }
}

impl AlertSink {
    /// Persist, broadcast and, for critical alerts, queue one remediation job.
    /// Remediation jobs only travel through the queue; the job table and the
    /// store never hold them.
    pub async fn handle(&self, alert: Alert) {
        if let Err(e) = self.store.insert_alert(&alert) {
            warn!("persist alert id={} err={:#}", alert.id, e);
        }
        self.broadcaster.broadcast(&alert);
        if alert.is_critical() {
            self.remediate(alert).await;
        }
        self.metrics.alerts_handled.inc();
    }

    async fn remediate(&self, alert: Alert) {
        let mut job = Job::new(uuid::Uuid::new_v4().to_string(), "Alert Response", ALERT_RESPONSE, self.script.as_str())
            .with_arg("ALERT_ID", alert.id.as_str())
            .with_arg("ALERT_SEVERITY", alert.severity.as_str());
        job.status = JobStatus::Queued;
        let envelope = JobEnvelope { job, alert: Some(alert) };

        let payload = match envelope.to_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("serialize remediation job err={}", e);
                return;
            }
        };
        if let Err(e) = self.queue.push(&self.task_queue, payload).await {
            self.metrics.queue_push_failures.inc();
            warn!("failed to queue remediation job id={} err={:#}", envelope.job.id, e);
            return;
        }
        self.metrics.remediations_queued.inc();
        info!("remediation job id={} alert={} queued", envelope.job.id, envelope.alert.as_ref().map_or("-", |a| a.id.as_str()));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ops_core::alert::Severity;
    use ops_core::queue::MemQueue;
    use ops_core::store::{KvStore, MemKv};
    use std::time::Duration;

    pub(crate) fn sink() -> (AlertSink, Arc<MemQueue>, Arc<dyn Store>) {
        let metrics = Arc::new(Metrics::new());
        let queue = Arc::new(MemQueue::in_memory());
        let store: Arc<dyn Store> = Arc::new(KvStore::new(MemKv::default()));
        let sink = AlertSink {
            store: store.clone(),
            queue: queue.clone(),
            broadcaster: Broadcaster::new(metrics.clone()),
            task_queue: "task_queue".into(),
            script: "scripts/alert_handler.py".into(),
            metrics,
        };
        (sink, queue, store)
    }

    #[tokio::test]
    async fn critical_alert_queues_one_remediation() {
        let (sink, queue, store) = sink();
        let mut sub = sink.broadcaster.add();
        let alert = Alert::from_log_line("FATAL: out of memory", "/var/log/app.log");
        sink.handle(alert.clone()).await;

        assert_eq!(store.alerts(10).unwrap(), vec![alert.clone()]);
        assert!(sub.rx.try_recv().is_ok());
        assert_eq!(queue.len("task_queue").unwrap(), 1);

        let raw = queue.pop("task_queue", Duration::from_millis(10)).await.unwrap().unwrap();
        let env: JobEnvelope = serde_json::from_slice(&raw).unwrap();
        assert_eq!(env.job.kind, ALERT_RESPONSE);
        assert_eq!(env.job.command, "scripts/alert_handler.py");
        assert_eq!(env.job.status, JobStatus::Queued);
        assert_eq!(env.alert, Some(alert));
        assert!(store.jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn remediation_results_leave_no_job_behind() {
        use crate::scheduler::{tests::opts, TaskScheduler};
        use ops_core::job::WorkerResult;

        let (sink, queue, store) = sink();
        let scheduler = TaskScheduler::new(store.clone(), queue.clone(), sink.metrics.clone(), opts());
        sink.handle(Alert::from_log_line("error: disk failure on sdb", "/var/log/syslog")).await;

        let raw = queue.pop("task_queue", Duration::from_millis(10)).await.unwrap().unwrap();
        let env: JobEnvelope = serde_json::from_slice(&raw).unwrap();
        let done = WorkerResult { task_id: env.job.id, status: "completed".into(), message: None, return_code: Some(0) };
        assert!(!scheduler.apply_result(&done));

        assert!(scheduler.get_tasks().is_empty());
        assert!(store.jobs().unwrap().is_empty());
        assert_eq!(scheduler.restore().unwrap(), 0);
    }

    #[tokio::test]
    async fn non_critical_alerts_are_not_remediated() {
        let (sink, queue, store) = sink();
        sink.handle(Alert::new("log_alert", "warning: disk at 85%", Severity::Warning)).await;
        sink.handle(Alert::new("log_alert", "user logged in", Severity::Info)).await;
        assert_eq!(queue.len("task_queue").unwrap(), 0);
        assert_eq!(store.alerts(10).unwrap().len(), 2);
        assert!(store.jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn overflow_is_shed_not_blocked() {
        let (sink, _, store) = sink();
        let metrics = sink.metrics.clone();
        let (pipeline, consumer) = AlertPipeline::channel(100, sink);

        let accepted = (0..150)
            .filter(|i| pipeline.submit(Alert::new("log_alert", format!("line {i}"), Severity::Info)))
            .count();
        assert_eq!(accepted, 100);
        assert_eq!(metrics.alerts_dropped.get(), 50);

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(consumer.run(stop_rx));
        for _ in 0..100 {
            if metrics.alerts_handled.get() == 100 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop_tx.send_replace(true);
        task.await.unwrap();

        assert_eq!(metrics.alerts_handled.get(), 100);
        assert_eq!(store.alerts(1_000).unwrap().len(), 100);
    }

    #[tokio::test]
    async fn submit_after_consumer_gone_reports_drop() {
        let (sink, _, _) = sink();
        let (pipeline, consumer) = AlertPipeline::channel(4, sink);
        drop(consumer);
        assert!(!pipeline.submit(Alert::new("manual", "x", Severity::Info)));
    }
}
