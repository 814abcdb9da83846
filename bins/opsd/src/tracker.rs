use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use ops_core::job::WorkerResult;
use ops_core::queue::Queue;

use crate::module::stopped;
use crate::scheduler::TaskScheduler;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Drains the results queue and folds each worker report into the
/// scheduler's job table.
pub struct WorkerStatusTracker {
    scheduler: TaskScheduler,
    queue: Arc<dyn Queue>,
    result_queue: String,
    wait: Duration,
}

impl WorkerStatusTracker {
    pub fn new(scheduler: TaskScheduler, queue: Arc<dyn Queue>, result_queue: String, wait: Duration) -> Self {
        Self { scheduler, queue, result_queue, wait }
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!("tracking results on {}", self.result_queue);
        loop {
            let popped = tokio::select! {
                r = self.queue.pop(&self.result_queue, self.wait) => r,
                _ = stopped(&mut stop) => break,
            };
            match popped {
                Ok(Some(payload)) => {
                    self.handle(&payload);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("read results err={:#}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                        _ = stopped(&mut stop) => break,
                    }
                }
            }
        }
        info!("result tracker stopping");
    }

    /// Apply one raw result. Malformed payloads are logged and skipped.
    pub fn handle(&self, payload: &[u8]) -> bool {
        match serde_json::from_slice::<WorkerResult>(payload) {
            Ok(result) => self.scheduler.apply_result(&result),
            Err(e) => {
                debug!("skip malformed result: {}", e);
                false
            }
        }
    }
}
