use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use ops_core::alert::Alert;

use super::pipeline::AlertPipeline;
use crate::module::stopped;

/// Longest partial line kept while waiting for its newline.
pub const MAX_LINE: usize = 64 * 1024;

#[cfg(unix)]
fn file_id(m: &Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((m.dev(), m.ino()))
}

#[cfg(not(unix))]
fn file_id(_: &Metadata) -> Option<(u64, u64)> {
    None
}

/// Polling tail of one file. Starts at the end of the file as it was when
/// opened; earlier content is never matched.
pub struct Tailer {
    path: PathBuf,
    source: String,
    patterns: Vec<Regex>,
    poll: Duration,
    pipeline: AlertPipeline,
    reader: BufReader<File>,
    offset: u64,
    // Bytes of a line whose newline has not arrived yet.
    pending: Vec<u8>,
}

impl Tailer {
    pub async fn open(path: &Path, patterns: Vec<Regex>, poll: Duration, pipeline: AlertPipeline) -> io::Result<Self> {
        let mut file = File::open(path).await?;
        let offset = file.seek(SeekFrom::End(0)).await?;
        Ok(Self {
            path: path.to_path_buf(),
            source: path.display().to_string(),
            patterns,
            poll,
            pipeline,
            reader: BufReader::new(file),
            offset,
            pending: Vec::new(),
        })
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut tick = interval(self.poll);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!("tail {} err={}", self.source, e);
                    }
                }
                _ = stopped(&mut stop) => break,
            }
        }
        debug!("tail {} stopped at offset {}", self.source, self.offset);
    }

    /// Read whatever was appended since the last poll. Returns the number of
    /// alerts raised.
    ///
    /// A file truncated in place is read again from the start. A file
    /// replaced at the path (rename and create) has the rest of the old
    /// file read first, then the new file is followed from offset 0.
    pub async fn poll_once(&mut self) -> io::Result<usize> {
        let current = self.reader.get_ref().metadata().await?;
        if current.len() < self.offset {
            info!("{} truncated ({} < {}), reading from start", self.source, current.len(), self.offset);
            self.reader.seek(SeekFrom::Start(0)).await?;
            self.offset = 0;
            self.pending.clear();
        }
        let mut raised = self.drain().await?;

        match tokio::fs::metadata(&self.path).await {
            Ok(at_path) if file_id(&at_path) != file_id(&current) => {
                info!("{} replaced, following the new file", self.source);
                self.reader = BufReader::new(File::open(&self.path).await?);
                self.offset = 0;
                self.pending.clear();
                raised += self.drain().await?;
            }
            Ok(_) => {}
            // Rotated away and not recreated yet.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(raised)
    }

    async fn drain(&mut self) -> io::Result<usize> {
        let mut raised = 0;
        loop {
            let n = self.reader.read_until(b'\n', &mut self.pending).await?;
            if n == 0 {
                break;
            }
            self.offset += n as u64;
            if self.pending.last() != Some(&b'\n') {
                if self.pending.len() >= MAX_LINE {
                    warn!("{} line exceeds {} bytes without newline, matching it as is", self.source, MAX_LINE);
                    raised += self.take_line() as usize;
                }
                continue;
            }
            raised += self.take_line() as usize;
        }
        Ok(raised)
    }

    fn take_line(&mut self) -> bool {
        let line = String::from_utf8_lossy(&self.pending).trim_end_matches(['\r', '\n']).to_string();
        self.pending.clear();
        self.check(&line)
    }

    /// First matching pattern wins; one alert per line at most.
    fn check(&self, line: &str) -> bool {
        if !self.patterns.iter().any(|re| re.is_match(line)) {
            return false;
        }
        let alert = Alert::from_log_line(line, &self.source);
        debug!("{} matched severity={}", self.source, alert.severity);
        self.pipeline.submit(alert);
        true
    }
}
