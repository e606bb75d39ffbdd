//! Seed jobs from configuration.
//!
//! This module turns [`JobConfig`] definitions into jobs and creates them
//! through the [`JobService`].

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::Path;

use super::error::ConfigError;
use super::types::JobConfig;
use super::yaml::YamlLoader;
use crate::core::job::{Job, JobType};
use crate::core::schedule::parse_duration;
use crate::service::{JobService, ServiceError};
use crate::storage::JobFilter;

/// When a built job should run.
#[derive(Debug, Clone, PartialEq)]
pub enum SeedSchedule {
    /// Once, at the given time.
    At(DateTime<Utc>),
    /// On every occurrence of a recurrence expression.
    Recurring {
        expression: String,
        timezone: Option<String>,
    },
}

/// A job built from configuration, not yet persisted.
#[derive(Debug, Clone)]
pub struct SeedJob {
    pub job: Job,
    pub schedule: SeedSchedule,
}

/// Builder for creating jobs from YAML configuration.
pub struct JobConfigBuilder;

impl JobConfigBuilder {
    /// Build a job from a definition, resolving relative schedules against `now`.
    pub fn build(config: &JobConfig, now: DateTime<Utc>) -> Result<SeedJob, ConfigError> {
        YamlLoader::validate_job_config(config)?;

        let schedule = match config.schedule.expression() {
            Some(expression) => SeedSchedule::Recurring {
                expression,
                timezone: config.schedule.timezone.clone(),
            },
            None => {
                let at = match (&config.schedule.at, &config.schedule.after) {
                    (Some(at), _) => *at,
                    (None, Some(after)) => {
                        let delay = parse_duration(after)
                            .map_err(|e| ConfigError::invalid_job(&config.name, e.to_string()))?;
                        let delay = chrono::Duration::from_std(delay).map_err(|_| {
                            ConfigError::invalid_job(&config.name, "delay out of range")
                        })?;
                        now + delay
                    }
                    (None, None) => now,
                };
                SeedSchedule::At(at)
            }
        };

        let job_type = match (&schedule, config.job_type) {
            (SeedSchedule::Recurring { .. }, _) => JobType::Recurring,
            (SeedSchedule::At(_), Some(JobType::Batch)) => JobType::Batch,
            (SeedSchedule::At(_), _) => JobType::OneTime,
        };

        let mut job = Job::new(&config.name, job_type).with_priority(config.priority);
        if let Some(description) = &config.description {
            job = job.with_description(description);
        }
        if let Some(max_retries) = config.max_retries {
            job = job.with_max_retries(max_retries);
        }
        if let Some(owner) = &config.created_by {
            job = job.with_created_by(owner);
        }
        if let Some(command) = &config.command {
            let payload = command
                .to_payload()
                .map_err(|e| ConfigError::invalid_job(&config.name, e.to_string()))?;
            job = job.with_payload(payload);
        } else if let Some(payload) = &config.payload {
            job = job.with_payload(payload);
        }

        Ok(SeedJob { job, schedule })
    }
}

/// Load all job definitions from a directory of `.yaml`/`.yml` files.
pub fn load_jobs_from_directory(dir: impl AsRef<Path>) -> Result<Vec<JobConfig>, ConfigError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(ConfigError::InvalidConfig(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }

    let read_dir_error = |source| ConfigError::DirReadError {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_dir_error)? {
        let path = entry.map_err(read_dir_error)?.path();
        if let Some(ext) = path.extension()
            && (ext == "yaml" || ext == "yml")
        {
            paths.push(path);
        }
    }
    paths.sort();

    let mut jobs = Vec::with_capacity(paths.len());
    for path in paths {
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::FileReadError {
            path: path.clone(),
            source,
        })?;
        let config = YamlLoader::parse_job_config(&content).map_err(|e| match e {
            ConfigError::YamlError(source) => ConfigError::YamlFileError { path, source },
            other => other,
        })?;
        jobs.push(config);
    }
    Ok(jobs)
}

/// Create the configured jobs that do not exist yet.
///
/// Jobs are matched by name, so restarting against a persistent store does
/// not duplicate them. Returns the jobs created.
pub async fn seed_jobs(service: &JobService, configs: &[JobConfig]) -> Result<Vec<Job>, SeedError> {
    let now = Utc::now();
    let existing: HashSet<String> = service
        .list(&JobFilter::new())
        .await?
        .into_iter()
        .map(|job| job.name)
        .collect();

    let mut created = Vec::new();
    for config in configs {
        if existing.contains(&config.name) {
            tracing::debug!(job_name = %config.name, "seed job already exists, skipping");
            continue;
        }

        let seed = JobConfigBuilder::build(config, now)?;
        let job = match seed.schedule {
            SeedSchedule::At(at) if seed.job.job_type == JobType::Batch => {
                service.create_batch(seed.job, at).await?
            }
            SeedSchedule::At(at) => service.create_one_time(seed.job, at).await?,
            SeedSchedule::Recurring {
                expression,
                timezone,
            } => {
                service
                    .create_recurring(seed.job, &expression, timezone.as_deref())
                    .await?
            }
        };
        created.push(job);
    }

    tracing::info!(created = created.len(), configured = configs.len(), "seeded jobs");
    Ok(created)
}

/// Errors raised while seeding jobs.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}
