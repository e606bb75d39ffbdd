//! External command runner.
//!
//! [`CommandRunner`] interprets a job's payload as a JSON command spec and
//! runs it as a subprocess:
//!
//! ```json
//! {"command": "pg_dump", "args": ["-Fc", "app"], "env": {"PGHOST": "db"},
//!  "working_dir": "/backups", "timeout_secs": 600}
//! ```
//!
//! Only `command` is required. A non-zero exit status fails the job with the
//! exit code and captured stderr; a timeout fails it with
//! [`JobError::Timeout`]. The subprocess is killed when the timeout elapses.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use super::runner::{JobError, JobRunner};
use crate::core::job::Job;

/// Command description carried in a job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandSpec {
    /// Create a spec for `command` with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            timeout_secs: None,
        }
    }

    /// Add multiple arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a single environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the execution timeout in seconds.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Parse a payload string.
    pub fn parse(payload: &str) -> Result<Self, JobError> {
        let spec: CommandSpec = serde_json::from_str(payload)
            .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
        if spec.command.trim().is_empty() {
            return Err(JobError::InvalidPayload("command is empty".into()));
        }
        Ok(spec)
    }

    /// Render as a payload string.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Runs command payloads as subprocesses.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    default_timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeout applied when a payload does not set `timeout_secs`.
    pub fn with_default_timeout(mut self, duration: Duration) -> Self {
        self.default_timeout = Some(duration);
        self
    }
}

#[async_trait]
impl JobRunner for CommandRunner {
    async fn run(&self, job: &Job) -> Result<(), JobError> {
        let payload = job
            .payload
            .as_deref()
            .ok_or_else(|| JobError::InvalidPayload("job has no payload".into()))?;
        let spec = CommandSpec::parse(payload)?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let limit = spec
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.default_timeout);
        let output = match limit {
            Some(duration) => timeout(duration, cmd.output())
                .await
                .map_err(|_| JobError::Timeout(duration))?
                .map_err(|e| JobError::ExecutionFailed(e.to_string()))?,
            None => cmd
                .output()
                .await
                .map_err(|e| JobError::ExecutionFailed(e.to_string()))?,
        };

        if output.status.success() {
            tracing::debug!(
                job_id = %job.id,
                stdout_bytes = output.stdout.len(),
                "command succeeded"
            );
            Ok(())
        } else {
            Err(JobError::CommandFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
