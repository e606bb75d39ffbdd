//! Configuration type definitions.
//!
//! This module contains the structures deserialized from `cadence.yaml`:
//! engine timing, storage selection and seed job definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::job::JobType;
use crate::core::retry::BackoffPolicy;
use crate::execution::CommandSpec;
use crate::scheduler::SchedulerSettings;

/// Top-level configuration (cadence.yaml).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    /// Engine timing and capacity.
    pub engine: EngineConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Jobs created when the engine starts.
    pub jobs: Vec<JobConfig>,
    /// Directory of additional job files, one job per file.
    pub jobs_dir: Option<PathBuf>,
}

/// Engine settings. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub one_time_interval_secs: u64,
    pub recurring_interval_secs: u64,
    pub retry_sweep_interval_secs: u64,
    pub stuck_check_interval_secs: u64,
    pub stuck_timeout_secs: u64,
    pub job_workers: usize,
    pub retry_workers: usize,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&SchedulerSettings::default())
    }
}

impl EngineConfig {
    fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            one_time_interval_secs: settings.one_time_interval.as_secs(),
            recurring_interval_secs: settings.recurring_interval.as_secs(),
            retry_sweep_interval_secs: settings.retry_sweep_interval.as_secs(),
            stuck_check_interval_secs: settings.stuck_check_interval.as_secs(),
            stuck_timeout_secs: settings.stuck_timeout.as_secs(),
            job_workers: settings.job_workers,
            retry_workers: settings.retry_workers,
            backoff_base_secs: settings.backoff.base.as_secs(),
            backoff_max_secs: settings.backoff.max_delay.as_secs(),
            shutdown_timeout_secs: settings.shutdown_timeout.as_secs(),
        }
    }

    /// Convert to scheduler settings.
    pub fn to_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            one_time_interval: Duration::from_secs(self.one_time_interval_secs),
            recurring_interval: Duration::from_secs(self.recurring_interval_secs),
            retry_sweep_interval: Duration::from_secs(self.retry_sweep_interval_secs),
            stuck_check_interval: Duration::from_secs(self.stuck_check_interval_secs),
            stuck_timeout: Duration::from_secs(self.stuck_timeout_secs),
            job_workers: self.job_workers,
            retry_workers: self.retry_workers,
            backoff: BackoffPolicy::new(
                Duration::from_secs(self.backoff_base_secs),
                Duration::from_secs(self.backoff_max_secs),
            ),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Seed job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Human-readable name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Job type. Derived from the schedule when omitted; only `batch` needs
    /// to be spelled out.
    #[serde(rename = "type")]
    pub job_type: Option<JobType>,
    /// Command run by the default runner.
    pub command: Option<CommandSpec>,
    /// Raw payload for custom runners. Mutually exclusive with `command`.
    pub payload: Option<String>,
    #[serde(default)]
    pub priority: i32,
    /// Retry budget. Defaults to the job model default.
    pub max_retries: Option<u32>,
    pub created_by: Option<String>,
    /// When the job runs. Omitted means once, as soon as possible.
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// When a seed job runs.
///
/// At most one of `at`, `after`, `cron` and `every` may be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Absolute time of a one-time run (RFC 3339).
    pub at: Option<DateTime<Utc>>,
    /// Delay of a one-time run from engine start, e.g. `10m`.
    pub after: Option<String>,
    /// Cron expression or shortcut such as `@daily`.
    pub cron: Option<String>,
    /// Fixed interval such as `15m`.
    pub every: Option<String>,
    /// Timezone for `cron`.
    pub timezone: Option<String>,
}

impl ScheduleConfig {
    /// Whether the schedule recurs.
    pub fn is_recurring(&self) -> bool {
        self.cron.is_some() || self.every.is_some()
    }

    /// The recurrence expression understood by the schedule parser.
    pub fn expression(&self) -> Option<String> {
        match (&self.cron, &self.every) {
            (Some(cron), _) => Some(cron.clone()),
            (None, Some(every)) => Some(format!("@every {}", every)),
            (None, None) => None,
        }
    }
}
