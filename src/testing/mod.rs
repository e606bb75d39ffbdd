//! Testing utilities for users of the cadence library.
//!
//! - [`ScriptedRunner`]: A job runner with scripted failures, delays and panics
//! - [`RecordingHook`]: A notification hook that keeps everything it receives
//! - [`TestHarness`]: Wires an in-memory store and queue to a scheduler

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::core::job::Job;
use crate::core::types::JobId;
use crate::execution::{JobError, JobRunner};
use crate::notify::{Notification, NotificationHook, NotificationKind, NotifyError};
use crate::queue::InMemoryQueue;
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::storage::InMemoryJobStore;

#[derive(Debug, Clone)]
enum Script {
    /// Fail this many times, then succeed.
    FailTimes(u32),
    AlwaysFail,
    Panic,
}

/// A job runner whose behavior is scripted.
///
/// # Example
///
/// ```
/// use cadence::testing::ScriptedRunner;
///
/// // Fails twice, then succeeds on the third call
/// let runner = ScriptedRunner::failing_times(2);
/// assert_eq!(runner.call_count(), 0);
/// ```
pub struct ScriptedRunner {
    script: Script,
    error_message: String,
    delay: Option<Duration>,
    calls: AtomicU32,
    failures: AtomicU32,
    called: Mutex<Vec<JobId>>,
}

impl ScriptedRunner {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            error_message: "intentional test failure".to_string(),
            delay: None,
            calls: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            called: Mutex::new(Vec::new()),
        }
    }

    /// A runner that always succeeds.
    pub fn succeeding() -> Self {
        Self::with_script(Script::FailTimes(0))
    }

    /// A runner that fails `n` times, then succeeds.
    pub fn failing_times(n: u32) -> Self {
        Self::with_script(Script::FailTimes(n))
    }

    /// A runner that always fails with `message`.
    pub fn always_failing(message: impl Into<String>) -> Self {
        let mut runner = Self::with_script(Script::AlwaysFail);
        runner.error_message = message.into();
        runner
    }

    /// A runner whose body panics.
    pub fn panicking() -> Self {
        Self::with_script(Script::Panic)
    }

    /// Sleep for `delay` before producing the scripted result.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times the runner was invoked.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of invocations that failed.
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Job ids in invocation order.
    pub async fn calls(&self) -> Vec<JobId> {
        self.called.lock().await.clone()
    }
}

#[async_trait]
impl JobRunner for ScriptedRunner {
    async fn run(&self, job: &Job) -> Result<(), JobError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.called.lock().await.push(job.id);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fail = match self.script {
            Script::FailTimes(n) => call < n,
            Script::AlwaysFail => true,
            Script::Panic => panic!("scripted panic in job {}", job.name),
        };
        if fail {
            self.failures.fetch_add(1, Ordering::SeqCst);
            Err(JobError::ExecutionFailed(self.error_message.clone()))
        } else {
            Ok(())
        }
    }
}

/// A notification hook that records every notification.
#[derive(Default)]
pub struct RecordingHook {
    received: Mutex<Vec<Notification>>,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.received.lock().await.clone()
    }

    /// Notifications of one kind.
    pub async fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.received
            .lock()
            .await
            .iter()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationHook for RecordingHook {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.received.lock().await.push(notification.clone());
        Ok(())
    }
}

/// Test harness wiring in-memory collaborators to a [`Scheduler`].
///
/// The scheduler is built with fast settings (short backoff, no automatic
/// triggers firing during a typical test) so tests drive ticks explicitly.
///
/// # Example
///
/// ```ignore
/// let harness = TestHarness::new(ScriptedRunner::succeeding());
/// let (handle, task) = harness.scheduler().start().await;
/// ```
pub struct TestHarness {
    pub store: Arc<InMemoryJobStore>,
    pub queue: Arc<InMemoryQueue>,
    pub runner: Arc<ScriptedRunner>,
    pub hook: Arc<RecordingHook>,
    pub settings: SchedulerSettings,
}

impl TestHarness {
    /// Create a harness around `runner`.
    pub fn new(runner: ScriptedRunner) -> Self {
        Self {
            store: Arc::new(InMemoryJobStore::new()),
            queue: Arc::new(InMemoryQueue::new()),
            runner: Arc::new(runner),
            hook: Arc::new(RecordingHook::new()),
            settings: SchedulerSettings::for_tests(),
        }
    }

    /// Override the scheduler settings.
    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build a scheduler over the harness collaborators.
    pub fn scheduler(&self) -> Scheduler<InMemoryJobStore> {
        Scheduler::with_store(Arc::clone(&self.store))
            .with_queue(self.queue.clone())
            .with_runner(self.runner.clone())
            .with_hook(self.hook.clone())
            .with_settings(self.settings.clone())
    }
}
