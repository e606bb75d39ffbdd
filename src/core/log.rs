//! Execution log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::types::JobId;

/// Severity of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
    Trace,
}

impl LogLevel {
    /// Stable textual form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// An immutable, append-only record of something that happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    /// Worker that produced the entry, e.g. `job-worker-3`.
    pub worker: Option<String>,
}

impl ExecutionLog {
    /// Create an entry stamped with the current time.
    pub fn new(job_id: JobId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            job_id,
            level,
            message: message.into(),
            details: None,
            executed_at: Utc::now(),
            duration_ms: None,
            worker: None,
        }
    }

    pub fn info(job_id: JobId, message: impl Into<String>) -> Self {
        Self::new(job_id, LogLevel::Info, message)
    }

    pub fn warn(job_id: JobId, message: impl Into<String>) -> Self {
        Self::new(job_id, LogLevel::Warn, message)
    }

    pub fn error(job_id: JobId, message: impl Into<String>) -> Self {
        Self::new(job_id, LogLevel::Error, message)
    }

    /// Attach free-form details.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Attach the execution duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Attach the worker identity.
    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    /// Override the timestamp.
    pub fn at(mut self, executed_at: DateTime<Utc>) -> Self {
        self.executed_at = executed_at;
        self
    }
}
