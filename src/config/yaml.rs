//! YAML configuration parsing.
//!
//! Parses `cadence.yaml` and standalone job files, and validates them before
//! anything touches the store.

use std::collections::HashSet;
use std::path::Path;

use super::error::ConfigError;
use super::types::{CadenceConfig, EngineConfig, JobConfig, StorageConfig};
use crate::core::job::JobType;
use crate::core::schedule::{Recurrence, parse_duration};

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load and validate configuration from a file.
    pub fn load_config(path: impl AsRef<Path>) -> Result<CadenceConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: CadenceConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse_config(yaml: &str) -> Result<CadenceConfig, ConfigError> {
        let config: CadenceConfig = serde_yaml::from_str(yaml)?;
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Parse and validate a single job definition.
    pub fn parse_job_config(yaml: &str) -> Result<JobConfig, ConfigError> {
        let config: JobConfig = serde_yaml::from_str(yaml)?;
        Self::validate_job_config(&config)?;
        Ok(config)
    }

    /// Validate the whole configuration.
    pub fn validate_config(config: &CadenceConfig) -> Result<(), ConfigError> {
        Self::validate_engine_config(&config.engine)?;

        if let StorageConfig::Sqlite { path } = &config.storage {
            if path.trim().is_empty() {
                return Err(ConfigError::InvalidConfig("sqlite path is empty".into()));
            }
        }

        let mut names = HashSet::new();
        for job in &config.jobs {
            Self::validate_job_config(job)?;
            if !names.insert(job.name.as_str()) {
                return Err(ConfigError::invalid_job(&job.name, "duplicate job name"));
            }
        }
        Ok(())
    }

    fn validate_engine_config(engine: &EngineConfig) -> Result<(), ConfigError> {
        let intervals = [
            ("one_time_interval_secs", engine.one_time_interval_secs),
            ("recurring_interval_secs", engine.recurring_interval_secs),
            ("retry_sweep_interval_secs", engine.retry_sweep_interval_secs),
            ("stuck_check_interval_secs", engine.stuck_check_interval_secs),
            ("stuck_timeout_secs", engine.stuck_timeout_secs),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!("{} cannot be zero", field)));
            }
        }

        // A zero-sized lane could never run anything.
        if engine.job_workers == 0 || engine.retry_workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "job_workers and retry_workers must be at least 1".into(),
            ));
        }
        if engine.backoff_base_secs > engine.backoff_max_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "backoff_base_secs ({}) exceeds backoff_max_secs ({})",
                engine.backoff_base_secs, engine.backoff_max_secs
            )));
        }
        Ok(())
    }

    /// Validate a job definition.
    pub fn validate_job_config(config: &JobConfig) -> Result<(), ConfigError> {
        let name = config.name.as_str();
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("job name cannot be empty".into()));
        }

        if config.command.is_some() && config.payload.is_some() {
            return Err(ConfigError::invalid_job(
                name,
                "set either command or payload, not both",
            ));
        }
        if let Some(command) = &config.command {
            if command.command.trim().is_empty() {
                return Err(ConfigError::invalid_job(name, "command is empty"));
            }
        }

        let schedule = &config.schedule;
        let set = [
            schedule.at.is_some(),
            schedule.after.is_some(),
            schedule.cron.is_some(),
            schedule.every.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if set > 1 {
            return Err(ConfigError::invalid_job(
                name,
                "schedule takes only one of at, after, cron, every",
            ));
        }

        if let Some(after) = &schedule.after {
            parse_duration(after).map_err(|e| ConfigError::invalid_job(name, e.to_string()))?;
        }
        if let Some(expression) = schedule.expression() {
            let timezone = schedule.timezone.as_deref().unwrap_or("UTC");
            Recurrence::with_timezone(expression, timezone)
                .map_err(|e| ConfigError::invalid_job(name, e.to_string()))?;
        }

        match (config.job_type, schedule.is_recurring()) {
            (Some(JobType::Recurring), false) => Err(ConfigError::invalid_job(
                name,
                "recurring jobs need a cron or every schedule",
            )),
            (Some(job_type @ (JobType::OneTime | JobType::Batch)), true) => {
                Err(ConfigError::invalid_job(
                    name,
                    format!("{} jobs cannot have a recurring schedule", job_type),
                ))
            }
            _ => Ok(()),
        }
    }
}
