use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alert::Alert;

/// Lifecycle of a job: `created -> queued -> {completed | failed}`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Registered, never enqueued.
    #[default]
    Created,
    /// Pushed onto the task queue.
    Queued,
    /// A worker reported success (or acknowledged an alert).
    Completed,
    /// A worker reported failure (including `error` and `timeout`).
    Failed,
}

impl JobStatus {
    /// Name used on the wire and in the store.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a worker reports a status we do not understand.
#[derive(Debug, thiserror::Error)]
#[error("unknown job status {0:?}")]
pub struct UnknownStatus(String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(JobStatus::Created),
            "queued" => Ok(JobStatus::Queued),
            "completed" | "acknowledged" => Ok(JobStatus::Completed),
            "failed" | "error" | "timeout" => Ok(JobStatus::Failed),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// A unit of automation work, either on-demand or recurring.
///
/// Field names on the wire follow the worker protocol (`type`, `script`,
/// `args`, `created`).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Job {
    /// Caller-supplied or generated identity.
    #[serde(default)]
    pub id: String,
    /// Human readable name.
    #[serde(default)]
    pub name: String,
    /// Free-form classification tag (`cicd`, `vcs`, `monitor`, ...).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Script reference executed by the worker.
    #[serde(rename = "script", default)]
    pub command: String,
    /// Recurrence expression; empty means on-demand only.
    #[serde(default)]
    pub schedule: String,
    /// Arguments handed to the script as environment.
    #[serde(rename = "args", default)]
    pub arguments: BTreeMap<String, String>,
    /// Current lifecycle state.
    #[serde(default)]
    pub status: JobStatus,
    /// Creation time.
    #[serde(rename = "created", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// New on-demand job with `created` status.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            command: command.into(),
            schedule: String::new(),
            arguments: BTreeMap::new(),
            status: JobStatus::Created,
            created_at: Utc::now(),
        }
    }

    /// Builder-style schedule setter.
    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = schedule.into();
        self
    }

    /// Builder-style argument setter.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// `true` when the job has a recurrence expression.
    pub fn is_recurring(&self) -> bool {
        !self.schedule.trim().is_empty()
    }
}

/// What actually goes onto the task queue: the job, plus the alert that
/// caused it for remediation jobs.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JobEnvelope {
    /// The job itself, flattened into the top-level object.
    #[serde(flatten)]
    pub job: Job,
    /// Triggering alert, for `alert_response` jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
}

impl JobEnvelope {
    /// Envelope for a plain job.
    pub fn plain(job: Job) -> Self {
        Self { job, alert: None }
    }

    /// JSON bytes for the queue.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Result message pushed back by a worker.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkerResult {
    /// Id of the job this result belongs to.
    pub task_id: String,
    /// Raw worker status (`completed`, `failed`, `error`, `timeout`).
    pub status: String,
    /// Optional diagnostic message.
    #[serde(default)]
    pub message: Option<String>,
    /// Exit code of the script, when it ran.
    #[serde(default)]
    pub return_code: Option<i32>,
}
