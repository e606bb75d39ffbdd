//! Lifecycle notifications.
//!
//! The engine raises a [`Notification`] on completions, failures,
//! dead-lettering and stuck-job timeouts. Hooks run fire-and-forget: a slow
//! or failing hook never delays or fails the job that triggered it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::core::job::Job;

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    JobCompleted,
    JobFailed,
    DeadLettered,
    StuckJob,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::JobCompleted => "job_completed",
            NotificationKind::JobFailed => "job_failed",
            NotificationKind::DeadLettered => "dead_lettered",
            NotificationKind::StuckJob => "stuck_job",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification with a snapshot of the job it concerns.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub job: Job,
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, job: Job) -> Self {
        Self {
            kind,
            job,
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Error reported by a hook. Only ever logged.
#[derive(Debug, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Receiver of lifecycle notifications.
#[async_trait]
pub trait NotificationHook: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Distributes notifications to registered hooks.
pub struct Notifier {
    hooks: RwLock<Vec<Arc<dyn NotificationHook>>>,
}

impl Notifier {
    /// Create a notifier with no hooks.
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Register a hook.
    pub async fn register(&self, hook: Arc<dyn NotificationHook>) {
        self.hooks.write().await.push(hook);
    }

    /// Deliver `notification` to every hook on its own task.
    ///
    /// Returns the spawned deliveries; callers are free to drop them.
    pub async fn send(&self, notification: Notification) -> Vec<JoinHandle<()>> {
        let hooks = self.hooks.read().await;
        let notification = Arc::new(notification);

        hooks
            .iter()
            .map(|hook| {
                let hook = Arc::clone(hook);
                let notification = Arc::clone(&notification);
                tokio::spawn(async move {
                    if let Err(e) = hook.notify(&notification).await {
                        tracing::warn!(
                            job_id = %notification.job.id,
                            kind = %notification.kind,
                            error = %e,
                            "notification hook failed"
                        );
                    }
                })
            })
            .collect()
    }

    /// Get the number of registered hooks.
    pub async fn hook_count(&self) -> usize {
        self.hooks.read().await.len()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook that writes notifications to the process log.
pub struct LoggingHook;

#[async_trait]
impl NotificationHook for LoggingHook {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let job = &notification.job;
        let details = notification.details.as_deref().unwrap_or("");
        match notification.kind {
            NotificationKind::JobCompleted => {
                tracing::info!(job_id = %job.id, job_name = %job.name, "job completed");
            }
            NotificationKind::JobFailed => {
                tracing::warn!(job_id = %job.id, job_name = %job.name, details, "job failed");
            }
            NotificationKind::DeadLettered | NotificationKind::StuckJob => {
                tracing::error!(
                    job_id = %job.id,
                    job_name = %job.name,
                    kind = %notification.kind,
                    details,
                    "job needs attention"
                );
            }
        }
        Ok(())
    }
}
