//! Scheduler engine for the job lifecycle.
//!
//! This module provides the periodic triggers that discover and claim due
//! jobs, the engine that wires them to the executor pool and the failure
//! pipeline, and the handle used to control a running engine.

mod dispatch;
mod engine;
mod handle;
mod periodic;
mod types;

pub use dispatch::{Dispatcher, TickReport};
pub use engine::Scheduler;
pub use handle::SchedulerHandle;
pub use periodic::{PeriodicScheduler, PeriodicTask};
pub use types::{SchedulerError, SchedulerSettings, SchedulerState, Trigger};
