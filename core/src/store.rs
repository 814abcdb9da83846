use anyhow::{Context, Result};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::alert::Alert;
use crate::job::Job;
use crate::metrics::Metrics;

/// Filesystem-backed key/value store used as the default KV engine.
#[derive(Clone)]
pub struct FsKv {
    root: PathBuf,
}

/// In-process key/value store; nothing survives a restart.
#[derive(Clone, Default)]
pub struct MemKv {
    map: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

/// Minimal key/value interface over byte keys and values.
pub trait Kv: Clone + Send + Sync + 'static {
    /// Get value bytes for `key`, if present.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    /// Set value bytes for `key`, overwriting if it exists.
    fn put(&self, key: &[u8], val: &[u8]) -> Result<()>;
    /// Delete `key`; returns `true` if a value existed.
    fn delete(&self, key: &[u8]) -> bool;
    /// Run `f` holding the exclusive lock `name`. Stores that other
    /// processes can open must make the lock visible to them too; the
    /// default assumes a store private to this process.
    fn with_lock<R>(&self, _name: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
        f()
    }
}

/// Serde helpers layered on top of any [`Kv`] implementation.
pub trait KvSerde: Kv {
    /// Deserialize type `T` stored at `key` using `bincode`.
    fn get_t<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key) {
            Some(bytes) => {
                let v = bincode::deserialize::<T>(&bytes)
                    .with_context(|| "bincode deserialize")?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }
    /// Serialize `val` with `bincode` and store at `key`.
    fn put_t<T: Serialize>(&self, key: &[u8], val: &T) -> Result<()> {
        let buf = bincode::serialize(val).with_context(|| "bincode serialize")?;
        self.put(key, &buf)
    }
}
impl<T: Kv> KvSerde for T {}

/// Default KV type exported by this crate (FS-backed).
pub type DefaultKv = FsKv;

/// Open an FS-backed KV rooted at `dir` (created if missing).
pub fn open_default<P: AsRef<Path>>(dir: P) -> Result<DefaultKv> {
    let root = dir.as_ref().to_path_buf();
    fs::create_dir_all(&root)
        .with_context(|| format!("create kv dir {}", root.display()))?;
    Ok(FsKv { root })
}

/// Build a namespaced key as bytes: `"{ns}:{key}"`.
pub fn ns(ns: &str, key: &str) -> Vec<u8> {
    let mut s = String::with_capacity(ns.len() + 1 + key.len());
    s.push_str(ns);
    s.push(':');
    s.push_str(key);
    s.into_bytes()
}

/* --------------------- impl FsKv --------------------- */

impl FsKv {
    fn path_for(&self, key: &[u8]) -> PathBuf {
        // Hex file names keep arbitrary key bytes portable.
        let mut name = String::with_capacity(key.len() * 2);
        for &b in key {
            name.push(hex_digit(b >> 4));
            name.push(hex_digit(b & 0xF));
        }
        self.root.join(name)
    }
}

fn hex_digit(n: u8) -> char {
    match n {
        0..=9 => (b'0' + n) as char,
        10..=15 => (b'a' + (n - 10)) as char,
        _ => '?',
    }
}

impl Kv for FsKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let path = self.path_for(key);
        let mut f = fs::File::open(&path).ok()?;
        let mut buf = Vec::new();
        if f.read_to_end(&mut buf).is_ok() { Some(buf) } else { None }
    }

    fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        // Write temp then rename so readers never see a torn value. Each
        // write gets its own temp file so concurrent puts cannot collide.
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(val).with_context(|| format!("write {}", tmp.display()))?;
        f.sync_all().with_context(|| format!("sync {}", tmp.display()))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("rename to {}", path.display()));
        }
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> bool {
        let path = self.path_for(key);
        fs::remove_file(path).is_ok()
    }

    /// Advisory `flock`-style lock on `<hex name>.lock`, shared by every
    /// process that opens the same directory.
    fn with_lock<R>(&self, name: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let path = self.path_for(name.as_bytes()).with_extension("lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open lock {}", path.display()))?;
        file.lock_exclusive().with_context(|| format!("lock {}", path.display()))?;
        let out = f();
        if let Err(e) = FileExt::unlock(&file) {
            warn!("unlock {} err={}", path.display(), e);
        }
        out
    }
}

/* --------------------- impl MemKv --------------------- */

impl Kv for MemKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.lock().get(key).cloned()
    }

    fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.map.lock().insert(key.to_vec(), val.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.map.lock().remove(key).is_some()
    }
}

/* --------------------- job/alert store --------------------- */

/// Durable home for job and alert records. Implementations must be safe to
/// call from many tasks at once.
pub trait Store: Send + Sync + 'static {
    /// Insert or replace a job by id.
    fn upsert_job(&self, job: &Job) -> Result<()>;
    /// Remove a job; `true` if it existed.
    fn delete_job(&self, id: &str) -> Result<bool>;
    /// All stored jobs, in registration order.
    fn jobs(&self) -> Result<Vec<Job>>;
    /// Persist a new alert.
    fn insert_alert(&self, alert: &Alert) -> Result<()>;
    /// Up to `limit` most recent alerts, newest first.
    fn alerts(&self, limit: usize) -> Result<Vec<Alert>>;
}

/// Alerts kept by [`KvStore`] before the oldest are deleted.
pub const DEFAULT_ALERT_RETENTION: usize = 10_000;

/// [`Store`] over any [`Kv`]: one record per key plus a registry list per
/// namespace, like `jobs:registry`.
pub struct KvStore<K: Kv> {
    kv: K,
    alert_retention: usize,
    // Serializes registry read-modify-write cycles.
    index_lock: Mutex<()>,
}

impl<K: Kv> KvStore<K> {
    /// Wrap `kv` with the default alert retention.
    pub fn new(kv: K) -> Self {
        Self::with_retention(kv, DEFAULT_ALERT_RETENTION)
    }

    /// Wrap `kv`, keeping at most `alert_retention` alerts.
    pub fn with_retention(kv: K, alert_retention: usize) -> Self {
        Self { kv, alert_retention: alert_retention.max(1), index_lock: Mutex::new(()) }
    }

    fn registry(&self, space: &str) -> Result<Vec<String>> {
        Ok(self.kv.get_t(&ns(space, "registry"))?.unwrap_or_default())
    }
}

impl<K: Kv> Store for KvStore<K> {
    fn upsert_job(&self, job: &Job) -> Result<()> {
        self.kv.put_t(&ns("jobs", &job.id), job)
            .with_context(|| format!("store job {}", job.id))?;
        let _g = self.index_lock.lock();
        let mut ids = self.registry("jobs")?;
        if !ids.iter().any(|i| i == &job.id) {
            ids.push(job.id.clone());
            self.kv.put_t(&ns("jobs", "registry"), &ids)?;
        }
        Ok(())
    }

    fn delete_job(&self, id: &str) -> Result<bool> {
        let _g = self.index_lock.lock();
        let mut ids = self.registry("jobs")?;
        let before = ids.len();
        ids.retain(|i| i != id);
        if ids.len() != before {
            self.kv.put_t(&ns("jobs", "registry"), &ids)?;
        }
        Ok(self.kv.delete(&ns("jobs", id)))
    }

    fn jobs(&self) -> Result<Vec<Job>> {
        let ids = self.registry("jobs")?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.kv.get_t::<Job>(&ns("jobs", &id)) {
                Ok(Some(job)) => out.push(job),
                Ok(None) => {}
                Err(e) => warn!("skip unreadable job id={} err={:#}", id, e),
            }
        }
        Ok(out)
    }

    fn insert_alert(&self, alert: &Alert) -> Result<()> {
        self.kv.put_t(&ns("alerts", &alert.id), alert)
            .with_context(|| format!("store alert {}", alert.id))?;
        let _g = self.index_lock.lock();
        let mut ids = self.registry("alerts")?;
        ids.push(alert.id.clone());
        if ids.len() > self.alert_retention {
            let excess = ids.len() - self.alert_retention;
            for old in ids.drain(..excess) {
                self.kv.delete(&ns("alerts", &old));
            }
        }
        self.kv.put_t(&ns("alerts", "registry"), &ids)
    }

    fn alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        let ids = self.registry("alerts")?;
        let mut out = Vec::with_capacity(limit.min(ids.len()));
        for id in ids.iter().rev().take(limit) {
            if let Some(a) = self.kv.get_t::<Alert>(&ns("alerts", id))? {
                out.push(a);
            }
        }
        Ok(out)
    }
}

/// Decorator that wraps every storage operation in a span and records its
/// duration and outcome.
pub struct Traced<S> {
    inner: S,
    metrics: Arc<Metrics>,
}

impl<S: Store> Traced<S> {
    /// Wrap `inner`; failures are counted in `metrics.store_errors`.
    pub fn new(inner: S, metrics: Arc<Metrics>) -> Self {
        Self { inner, metrics }
    }

    fn observe<T>(&self, op: &'static str, key: &str, f: impl FnOnce(&S) -> Result<T>) -> Result<T> {
        let span = tracing::debug_span!("store", op, key);
        let _enter = span.enter();
        let started = Instant::now();
        let res = f(&self.inner);
        let elapsed_us = started.elapsed().as_micros() as u64;
        match &res {
            Ok(_) => debug!(elapsed_us, "ok"),
            Err(e) => {
                self.metrics.store_errors.inc();
                warn!(elapsed_us, "failed: {:#}", e);
            }
        }
        res
    }
}

impl<S: Store> Store for Traced<S> {
    fn upsert_job(&self, job: &Job) -> Result<()> {
        self.observe("upsert_job", &job.id, |s| s.upsert_job(job))
    }

    fn delete_job(&self, id: &str) -> Result<bool> {
        self.observe("delete_job", id, |s| s.delete_job(id))
    }

    fn jobs(&self) -> Result<Vec<Job>> {
        self.observe("jobs", "", |s| s.jobs())
    }

    fn insert_alert(&self, alert: &Alert) -> Result<()> {
        self.observe("insert_alert", &alert.id, |s| s.insert_alert(alert))
    }

    fn alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        self.observe("alerts", "", |s| s.alerts(limit))
    }
}
