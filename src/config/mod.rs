//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the engine, the store
//! and seed jobs.

mod builder;
mod error;
mod types;
mod yaml;

pub use builder::{
    JobConfigBuilder, SeedError, SeedJob, SeedSchedule, load_jobs_from_directory, seed_jobs,
};
pub use error::ConfigError;
pub use types::{CadenceConfig, EngineConfig, JobConfig, ScheduleConfig, StorageConfig};
pub use yaml::YamlLoader;
