//! Core domain model: jobs, schedules, the lifecycle state machine,
//! retry backoff and execution logs.

pub mod job;
pub mod log;
pub mod retry;
pub mod schedule;
pub mod state;
pub mod types;
