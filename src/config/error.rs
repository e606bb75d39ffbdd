//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a specific file.
    #[error("failed to read file '{path}': {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to read a directory of job files.
    #[error("failed to read directory '{path}': {source}")]
    DirReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Failed to parse YAML from a specific file.
    #[error("YAML parse error in '{path}': {source}")]
    YamlFileError {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid engine or storage setting.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid job definition.
    #[error("invalid job '{job}': {reason}")]
    InvalidJob { job: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid_job(job: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidJob {
            job: job.to_string(),
            reason: reason.into(),
        }
    }
}
