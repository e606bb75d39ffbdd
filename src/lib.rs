//! cadence - a job lifecycle engine.
//!
//! Jobs are persisted in a [`JobStore`], discovered by periodic triggers,
//! claimed through conditional updates, and executed on bounded lanes. Failed
//! executions flow through a retry pipeline with exponential backoff and end
//! in a dead-letter sink once their retry budget is spent. A monitor
//! force-fails jobs that stay Running too long.
//!
//! ```ignore
//! let store = InMemoryJobStore::new();
//! let scheduler = Scheduler::new(store).with_hook(Arc::new(LoggingHook));
//! let (handle, task) = scheduler.start().await;
//! ```

pub mod admin;
pub mod config;
pub mod core;
pub mod execution;
pub mod monitor;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod testing;

pub use admin::{Admin, JobStatistics};
pub use config::{CadenceConfig, ConfigError, JobConfig, StorageConfig, YamlLoader};
pub use core::job::{Job, JobStatus, JobType};
pub use core::log::{ExecutionLog, LogLevel};
pub use core::retry::BackoffPolicy;
pub use core::schedule::{JobSchedule, Recurrence, ScheduleError, ScheduleType};
pub use core::state::{Transition, TransitionError};
pub use core::types::JobId;
pub use execution::{CommandRunner, CommandSpec, ExecutorPool, JobError, JobRunner, Lane, Outcome};
pub use monitor::StuckJobMonitor;
pub use notify::{LoggingHook, Notification, NotificationHook, NotificationKind, Notifier};
pub use queue::{InMemoryQueue, MessageQueue, Topic};
pub use scheduler::{
    PeriodicScheduler, PeriodicTask, Scheduler, SchedulerError, SchedulerHandle,
    SchedulerSettings, SchedulerState, Trigger,
};
pub use service::{JobService, ServiceError};
pub use storage::{InMemoryJobStore, JobFilter, JobStore, StorageError};
#[cfg(feature = "sqlite")]
pub use storage::SqliteJobStore;
