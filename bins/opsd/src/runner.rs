use std::collections::BTreeMap;
use std::process::Stdio;

use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use ops_core::cfg::WorkerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("{command} exited with status {code:?}")]
    Exit { command: String, code: Option<i32> },
}

/// Runs worker scripts in-process, bypassing the queue. Does not touch job
/// state.
#[derive(Debug, Clone)]
pub struct Runner {
    interpreter: String,
    timeout: Option<Duration>,
}

impl Runner {
    pub fn new(interpreter: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self { interpreter: interpreter.into(), timeout }
    }

    pub fn from_config(cfg: &WorkerConfig) -> Self {
        Self::new(cfg.interpreter.clone(), cfg.exec_timeout_ms.map(Duration::from_millis))
    }

    /// Run `command` with `args` added to the inherited environment and wait
    /// for it to exit.
    pub async fn execute_immediate(&self, command: &str, args: &BTreeMap<String, String>) -> Result<(), ExecError> {
        let mut c = if self.interpreter.trim().is_empty() {
            Command::new(command)
        } else {
            let mut c = Command::new(&self.interpreter);
            c.arg(command);
            c
        };
        c.envs(args).stdin(Stdio::null()).kill_on_drop(true);

        info!("exec {} args={}", command, args.len());
        let fut = c.status();
        let status = match self.timeout {
            Some(after) => match timeout(after, fut).await {
                Ok(r) => r,
                Err(_) => return Err(ExecError::Timeout { command: command.to_string(), after }),
            },
            None => fut.await,
        }
        .map_err(|source| ExecError::Spawn { command: command.to_string(), source })?;

        if !status.success() {
            return Err(ExecError::Exit { command: command.to_string(), code: status.code() });
        }
        debug!("exec {} ok", command);
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;

    fn script(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "{body}").unwrap();
        f
    }

    fn path(f: &tempfile::NamedTempFile) -> String {
        f.path().to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn passes_arguments_as_environment() {
        let f = script(r#"[ "$DEPLOY_ENV" = "prod" ] && [ "$REGION" = "eu" ]"#);
        let args = BTreeMap::from([
            ("DEPLOY_ENV".to_string(), "prod".to_string()),
            ("REGION".to_string(), "eu".to_string()),
        ]);
        Runner::new("sh", None).execute_immediate(&path(&f), &args).await.unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let f = script("exit 3");
        let err = Runner::new("sh", None).execute_immediate(&path(&f), &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ExecError::Exit { code: Some(3), .. }));
    }

    #[tokio::test]
    async fn slow_commands_time_out() {
        let f = script("sleep 5");
        let runner = Runner::new("sh", Some(Duration::from_millis(100)));
        let err = runner.execute_immediate(&path(&f), &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let runner = Runner::new("", None);
        let err = runner.execute_immediate("/definitely/not/here", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
