use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::breaker;
use crate::job::Job;
use crate::logx::LogFormat;

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"opsd"`.
    pub application: &'static str,
}

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `pretty` or `json`.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Where the job/alert store and the queue live. Empty means
    /// `<config dir>/data`.
    #[serde(default)]
    pub data_dir: String,
    /// HTTP control plane.
    #[serde(default)]
    pub server: ServerConfig,
    /// Trigger loop and result reconciliation.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Immediate execution.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Log watching and alerting.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Circuit breaker around immediate execution.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Per-client request throttle.
    #[serde(default)]
    pub limiter: LimiterConfig,
    /// Jobs registered at startup.
    #[serde(default)]
    pub jobs: Vec<Job>,
    /// Files watched from startup.
    #[serde(default)]
    pub watches: Vec<WatchConfig>,
}

/// Listener addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Plain HTTP listen address; unset disables it.
    #[serde(default = "default_http_addr")]
    pub http_addr: Option<String>,
    /// HTTPS listen address; needs both PEM paths.
    #[serde(default)]
    pub https_addr: Option<String>,
    /// TLS certificate chain (PEM).
    #[serde(default)]
    pub tls_cert_pem: Option<String>,
    /// TLS private key (PEM).
    #[serde(default)]
    pub tls_key_pem: Option<String>,
}

/// Scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often due triggers are checked (ms).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Bounded wait on the results queue (ms).
    #[serde(default = "default_result_wait_ms")]
    pub result_wait_ms: u64,
    /// Queue workers consume jobs from.
    #[serde(default = "default_task_queue")]
    pub task_queue: String,
    /// Queue workers push results to.
    #[serde(default = "default_result_queue")]
    pub result_queue: String,
}

/// How immediate commands are run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Program used to run scripts; empty runs the command directly.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Kill the command after this long (ms).
    #[serde(default)]
    pub exec_timeout_ms: Option<u64>,
}

/// Log monitor knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Tail poll interval (ms).
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    /// Alert channel capacity; alerts beyond it are dropped.
    #[serde(default = "default_alert_capacity")]
    pub alert_capacity: usize,
    /// Script given to remediation jobs.
    #[serde(default = "default_remediation_script")]
    pub remediation_script: String,
}

/// Circuit breaker knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Half-open probe calls.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Rolling window while closed (ms, 0 = none).
    #[serde(default)]
    pub interval_ms: u64,
    /// Open duration (ms).
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,
    /// Trip after more than this many consecutive failures.
    #[serde(default = "default_trip_after")]
    pub trip_after: u32,
}

/// Rate limiter knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Tokens per second per client.
    #[serde(default = "default_rate")]
    pub rate_per_sec: f64,
    /// Bucket size.
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Clients tracked before LRU eviction.
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
}

/// A file to watch and the patterns that raise alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// File path.
    pub path: String,
    /// Regular expressions, checked in order.
    pub patterns: Vec<String>,
}

fn default_log_level() -> String { "info".to_string() }
fn default_http_addr() -> Option<String> { Some("0.0.0.0:8080".to_string()) }
fn default_tick_ms() -> u64 { 500 }
fn default_result_wait_ms() -> u64 { 5_000 }
fn default_task_queue() -> String { "task_queue".to_string() }
fn default_result_queue() -> String { "task_results".to_string() }
fn default_interpreter() -> String { "python".to_string() }
fn default_poll_ms() -> u64 { 1_000 }
fn default_alert_capacity() -> usize { 100 }
fn default_remediation_script() -> String { "scripts/alert_handler.py".to_string() }
fn default_max_requests() -> u32 { 1 }
fn default_breaker_timeout_ms() -> u64 { 60_000 }
fn default_trip_after() -> u32 { 5 }
fn default_rate() -> f64 { 100.0 }
fn default_burst() -> u32 { 200 }
fn default_max_keys() -> usize { 10_000 }

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            data_dir: String::new(),
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            monitor: MonitorConfig::default(),
            breaker: BreakerConfig::default(),
            limiter: LimiterConfig::default(),
            jobs: Vec::new(),
            watches: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { http_addr: default_http_addr(), https_addr: None, tls_cert_pem: None, tls_key_pem: None }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            result_wait_ms: default_result_wait_ms(),
            task_queue: default_task_queue(),
            result_queue: default_result_queue(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { interpreter: default_interpreter(), exec_timeout_ms: None }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_poll_ms(),
            alert_capacity: default_alert_capacity(),
            remediation_script: default_remediation_script(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            interval_ms: 0,
            timeout_ms: default_breaker_timeout_ms(),
            trip_after: default_trip_after(),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self { rate_per_sec: default_rate(), burst: default_burst(), max_keys: default_max_keys() }
    }
}

impl BreakerConfig {
    /// Breaker settings named `name`.
    pub fn settings(&self, name: &str) -> breaker::Settings {
        breaker::Settings {
            max_requests: self.max_requests,
            interval: Duration::from_millis(self.interval_ms),
            timeout: Duration::from_millis(self.timeout_ms),
            ..breaker::Settings::trip_after(name, self.trip_after)
        }
    }
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let pd = ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))?;
    let dir = pd.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Path of `config.toml` for this app.
pub fn config_path(app: &AppId) -> Result<PathBuf> {
    Ok(config_dir(app)?.join("config.toml"))
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    let path = config_path(app)?;
    if path.exists() {
        load_from(&path)
    } else {
        let cfg = Config::default();
        save_config(&path, &cfg)?;
        Ok(cfg)
    }
}

/// Load a config file from an explicit path.
pub fn load_from(path: &Path) -> Result<Config> {
    let txt = fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let cfg: Config = toml::from_str(&txt)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}

/// Resolve the data directory: `data_dir` if set, else `<config dir>/data`.
pub fn data_dir(app: &AppId, cfg: &Config) -> Result<PathBuf> {
    if cfg.data_dir.trim().is_empty() {
        Ok(config_dir(app)?.join("data"))
    } else {
        Ok(PathBuf::from(&cfg.data_dir))
    }
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gets_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.monitor.alert_capacity, 100);
        assert_eq!(cfg.scheduler.task_queue, "task_queue");
        assert_eq!(cfg.scheduler.result_queue, "task_results");
        assert_eq!(cfg.server.http_addr.as_deref(), Some("0.0.0.0:8080"));
    }

    #[test]
    fn seeds_jobs_and_watches() {
        let txt = r#"
            log_level = "debug"
            log_format = "json"

            [limiter]
            burst = 5

            [[jobs]]
            id = "nightly-backup"
            name = "backup"
            type = "monitor"
            script = "scripts/backup_automation.py"
            schedule = "0 2 * * *"
            args = { TARGET = "s3" }

            [[watches]]
            path = "/var/log/syslog"
            patterns = ["(?i)error", "oom"]
        "#;
        let cfg: Config = toml::from_str(txt).unwrap();
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.limiter.burst, 5);
        assert_eq!(cfg.limiter.rate_per_sec, 100.0);
        assert_eq!(cfg.jobs[0].kind, "monitor");
        assert_eq!(cfg.jobs[0].arguments["TARGET"], "s3");
        assert_eq!(cfg.watches[0].patterns.len(), 2);
    }

    #[test]
    fn default_config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        save_config(&path, &Config::default()).unwrap();
        let back = load_from(&path).unwrap();
        assert_eq!(back.breaker.trip_after, 5);
        assert_eq!(back.worker.interpreter, "python");
    }
}
