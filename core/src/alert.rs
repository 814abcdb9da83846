use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind given to alerts produced by a log watch.
pub const LOG_ALERT: &str = "log_alert";

/// Alert severity, ordered from least to most urgent.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Nothing actionable.
    #[default]
    Info,
    /// Worth a look.
    Warning,
    /// Triggers a remediation job.
    Critical,
}

const CRITICAL_WORDS: &[&str] = &["error", "fail", "critical", "fatal"];
const WARNING_WORDS: &[&str] = &["warn", "warning"];

impl Severity {
    /// Classify a log line. Case-insensitive; the critical class wins over
    /// the warning class.
    pub fn classify(line: &str) -> Self {
        let lower = line.to_lowercase();
        if CRITICAL_WORDS.iter().any(|w| lower.contains(w)) {
            Severity::Critical
        } else if WARNING_WORDS.iter().any(|w| lower.contains(w)) {
            Severity::Warning
        } else {
            Severity::Info
        }
    }

    /// Lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operational alert. Immutable once created.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Alert {
    /// Generated identity.
    pub id: String,
    /// Alert kind, e.g. [`LOG_ALERT`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Matched line or free-form description.
    pub message: String,
    /// Severity class.
    pub severity: Severity,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Where it came from (watched path for log alerts).
    #[serde(default)]
    pub source: Option<String>,
}

impl Alert {
    /// New alert with a fresh id and the current time.
    pub fn new(kind: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            message: message.into(),
            severity,
            timestamp: Utc::now(),
            source: None,
        }
    }

    /// Alert for a matched log line; severity comes from [`Severity::classify`].
    pub fn from_log_line(line: &str, source: &str) -> Self {
        let mut alert = Self::new(LOG_ALERT, line, Severity::classify(line));
        alert.source = Some(source.to_string());
        alert
    }

    /// `true` for alerts that must trigger remediation.
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_words_beat_warning_words() {
        assert_eq!(Severity::classify("WARN: disk FATAL"), Severity::Critical);
        assert_eq!(Severity::classify("warning: Error opening socket"), Severity::Critical);
        assert_eq!(Severity::classify("job failed"), Severity::Critical);
    }

    #[test]
    fn warning_and_info() {
        assert_eq!(Severity::classify("Warning: low memory"), Severity::Warning);
        assert_eq!(Severity::classify("[WARN] retrying"), Severity::Warning);
        assert_eq!(Severity::classify("user logged in"), Severity::Info);
        assert_eq!(Severity::classify(""), Severity::Info);
    }

    #[test]
    fn log_alert_carries_source() {
        let a = Alert::from_log_line("fatal: oom", "/var/log/app.log");
        assert_eq!(a.kind, LOG_ALERT);
        assert!(a.is_critical());
        assert_eq!(a.source.as_deref(), Some("/var/log/app.log"));
        assert!(!a.id.is_empty());
    }
}
