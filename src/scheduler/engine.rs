//! Scheduler engine implementation.
//!
//! The engine wires the collaborators together and owns their lifecycle:
//! - Periodic triggers for one-time jobs, recurring schedules, the retry
//!   sweep and the stuck-job monitor
//! - Consumers for the failure, retry and dead-letter topics
//! - The executor pool and its two lanes
//! - Pause, resume, manual ticks, run-now and graceful shutdown

use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use async_trait::async_trait;

use super::dispatch::Dispatcher;
use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::periodic::{PeriodicScheduler, PeriodicTask};
use super::types::{SchedulerCommand, SchedulerError, SchedulerSettings, SchedulerState, Trigger};
use crate::core::types::JobId;
use crate::execution::{CommandRunner, ExecutorPool, JobRunner, Outcome};
use crate::monitor::StuckJobMonitor;
use crate::notify::{NotificationHook, Notifier};
use crate::pipeline::{
    Consumer, DeadLetterHandler, FailureHandler, RetryConsumer, RetrySweep, spawn_consumer,
};
use crate::queue::{InMemoryQueue, MessageQueue, Topic};
use crate::service::{JobService, ServiceError};
use crate::storage::{JobStore, StorageError};

/// Everything the triggers and commands operate on once the engine runs.
struct Runtime {
    dispatcher: Dispatcher,
    sweep: RetrySweep,
    monitor: StuckJobMonitor,
    service: JobService,
    pool: ExecutorPool,
    retry: Arc<RetryConsumer>,
    state: Arc<RwLock<SchedulerState>>,
}

impl Runtime {
    /// Run one trigger and return how many jobs it acted on.
    async fn fire(&self, trigger: Trigger) -> Result<usize, SchedulerError> {
        match trigger {
            Trigger::OneTime => Ok(self.dispatcher.tick_one_time().await?.dispatched.len()),
            Trigger::Recurring => Ok(self.dispatcher.tick_recurring().await?.dispatched.len()),
            Trigger::RetrySweep => {
                let report = self.sweep.sweep().await?;
                Ok(report.republished + report.redispatched)
            }
            Trigger::StuckJobs => Ok(self.monitor.sweep().await?.len()),
        }
    }

    async fn run_now(&self, job_id: JobId) -> Result<Outcome, SchedulerError> {
        let handle = self.dispatcher.run_now(job_id).await?;
        Ok(handle.wait().await)
    }

    async fn cancel(&self, job_id: JobId) -> Result<crate::core::job::Job, SchedulerError> {
        match self.service.cancel(&job_id).await {
            Ok(job) => Ok(job),
            Err(ServiceError::Storage(StorageError::NotFound(_))) => {
                Err(SchedulerError::JobNotFound(job_id))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// A periodic trigger that does nothing unless the engine is running.
struct GatedTrigger {
    runtime: Arc<Runtime>,
    trigger: Trigger,
}

#[async_trait]
impl PeriodicTask for GatedTrigger {
    async fn run(&self) {
        let state = *self.runtime.state.read().await;
        if state != SchedulerState::Running {
            tracing::debug!(trigger = %self.trigger, state = ?state, "skipping trigger");
            return;
        }

        match self.runtime.fire(self.trigger).await {
            Ok(count) => {
                tracing::debug!(trigger = %self.trigger, count, "trigger finished");
            }
            Err(e) => {
                tracing::error!(trigger = %self.trigger, error = %e, "trigger failed");
            }
        }
    }
}

/// Main scheduler for the job lifecycle.
pub struct Scheduler<S: JobStore> {
    /// Storage backend.
    store: Arc<S>,
    /// Queue carrying the failure pipeline topics.
    queue: Arc<dyn MessageQueue>,
    /// Executes job bodies.
    runner: Arc<dyn JobRunner>,
    notifier: Arc<Notifier>,
    /// Hooks registered with the notifier on start.
    hooks: Vec<Arc<dyn NotificationHook>>,
    settings: SchedulerSettings,
}

impl<S: JobStore + 'static> Scheduler<S> {
    /// Create a new scheduler with the given store.
    pub fn new(store: S) -> Self {
        Self::with_store(Arc::new(store))
    }

    /// Create a new scheduler with a shared store.
    pub fn with_store(store: Arc<S>) -> Self {
        Self {
            store,
            queue: Arc::new(InMemoryQueue::new()),
            runner: Arc::new(CommandRunner::new()),
            notifier: Arc::new(Notifier::new()),
            hooks: Vec::new(),
            settings: SchedulerSettings::default(),
        }
    }

    /// Set the message queue.
    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = queue;
        self
    }

    /// Set the job runner.
    pub fn with_runner(mut self, runner: Arc<dyn JobRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Add a notification hook.
    pub fn with_hook(mut self, hook: Arc<dyn NotificationHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Share an existing notifier.
    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set timing and capacity.
    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Start the scheduler and return a handle for controlling it.
    pub async fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        for hook in &self.hooks {
            self.notifier.register(Arc::clone(hook)).await;
        }

        let settings = self.settings;
        let store: Arc<dyn JobStore> = self.store;
        let queue = self.queue;
        let notifier = self.notifier;

        let pool = ExecutorPool::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            self.runner,
            Arc::clone(&notifier),
        )
        .with_workers(settings.job_workers, settings.retry_workers);

        let failure = Arc::new(
            FailureHandler::new(Arc::clone(&store), Arc::clone(&queue)).with_backoff(settings.backoff),
        );
        let retry = Arc::new(RetryConsumer::new(Arc::clone(&store), pool.clone()));
        let dead_letter = Arc::new(DeadLetterHandler::new(
            Arc::clone(&store),
            Arc::clone(&notifier),
        ));

        let mut consumers = Vec::with_capacity(Topic::ALL.len());
        for (topic, consumer) in [
            (Topic::FailureEvents, failure as Arc<dyn Consumer>),
            (Topic::RetryPipeline, retry.clone() as Arc<dyn Consumer>),
            (Topic::DeadLetter, dead_letter as Arc<dyn Consumer>),
        ] {
            match queue.subscribe(topic).await {
                Ok(subscription) => consumers.push(spawn_consumer(consumer, subscription)),
                Err(e) => {
                    tracing::error!(topic = %topic, error = %e, "failed to subscribe consumer");
                }
            }
        }

        let state = Arc::new(RwLock::new(SchedulerState::Running));
        let runtime = Arc::new(Runtime {
            dispatcher: Dispatcher::new(Arc::clone(&store), pool.clone()),
            sweep: RetrySweep::new(
                Arc::clone(&store),
                Arc::clone(&queue),
                pool.clone(),
                settings.retry_sweep_interval,
            )
            .with_backoff(settings.backoff),
            monitor: StuckJobMonitor::new(Arc::clone(&store), Arc::clone(&notifier))
                .with_timeout(settings.stuck_timeout),
            service: JobService::new(Arc::clone(&store)),
            pool,
            retry,
            state: Arc::clone(&state),
        });

        let mut periodic = PeriodicScheduler::new();
        for trigger in Trigger::ALL {
            periodic.register_periodic(
                trigger.name(),
                settings.interval(trigger),
                GatedTrigger {
                    runtime: Arc::clone(&runtime),
                    trigger,
                },
            );
        }
        tracing::info!(
            triggers = ?periodic.task_names(),
            job_workers = settings.job_workers,
            retry_workers = settings.retry_workers,
            "scheduler started"
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let engine = Engine {
            runtime,
            periodic,
            consumers,
            settings,
        };
        let scheduler_task = tokio::spawn(async move {
            engine.run(command_rx).await;
        });

        (handle, scheduler_task)
    }
}

/// The running side of a started [`Scheduler`].
struct Engine {
    runtime: Arc<Runtime>,
    periodic: PeriodicScheduler,
    consumers: Vec<JoinHandle<()>>,
    settings: SchedulerSettings,
}

impl Engine {
    /// Command loop. Returns after shutdown.
    async fn run(self, mut command_rx: mpsc::Receiver<SchedulerCommand>) {
        let state = Arc::clone(&self.runtime.state);

        while let Some(command) = command_rx.recv().await {
            match command {
                SchedulerCommand::Tick { trigger, response } => {
                    let runtime = Arc::clone(&self.runtime);
                    tokio::spawn(async move {
                        let _ = response.send(runtime.fire(trigger).await);
                    });
                }
                SchedulerCommand::RunNow { job_id, response } => {
                    let runtime = Arc::clone(&self.runtime);
                    tokio::spawn(async move {
                        let _ = response.send(runtime.run_now(job_id).await);
                    });
                }
                SchedulerCommand::Cancel { job_id, response } => {
                    let _ = response.send(self.runtime.cancel(job_id).await);
                }
                SchedulerCommand::Pause { response } => {
                    *state.write().await = SchedulerState::Paused;
                    tracing::info!("Scheduler paused");
                    let _ = response.send(());
                }
                SchedulerCommand::Resume { response } => {
                    *state.write().await = SchedulerState::Running;
                    tracing::info!("Scheduler resumed");
                    let _ = response.send(());
                }
                SchedulerCommand::Shutdown { response } => {
                    self.shutdown().await;
                    let _ = response.send(());
                    return;
                }
            }
        }

        tracing::info!("All scheduler handles dropped, shutting down");
        self.shutdown().await;
    }

    async fn shutdown(self) {
        let Engine {
            runtime,
            periodic,
            consumers,
            settings,
        } = self;
        *runtime.state.write().await = SchedulerState::Stopped;

        periodic.shutdown().await;
        for consumer in &consumers {
            consumer.abort();
        }
        runtime.retry.cancel_timers().await;

        await_running_jobs(&runtime, &settings).await;
    }
}

/// Wait for in-flight executions, up to the shutdown timeout.
async fn await_running_jobs(runtime: &Runtime, settings: &SchedulerSettings) {
    let pool = &runtime.pool;
    let running_count = pool.active_count();

    if running_count == 0 {
        tracing::info!("No running jobs to wait for during shutdown");
        return;
    }

    tracing::info!(
        "Graceful shutdown: waiting for {} running job(s) to complete (timeout: {:?})",
        running_count,
        settings.shutdown_timeout
    );

    let start = tokio::time::Instant::now();
    if pool.wait_idle(settings.shutdown_timeout).await {
        tracing::info!("All running jobs completed gracefully in {:?}", start.elapsed());
    } else {
        tracing::warn!(
            "Graceful shutdown timeout ({:?}) exceeded with {} job(s) still running",
            settings.shutdown_timeout,
            pool.active_count()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::{Job, JobStatus, JobType};
    use crate::storage::InMemoryJobStore;
    use crate::testing::{ScriptedRunner, TestHarness};
    use chrono::Utc;
    use std::time::Duration;

    async fn wait_for_status(store: &InMemoryJobStore, id: &JobId, status: JobStatus) -> Job {
        for _ in 0..200 {
            let job = store.get_job(id).await.unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    async fn due_job(harness: &TestHarness) -> Job {
        JobService::new(harness.store.clone())
            .create_one_time(Job::new("report", JobType::OneTime), Utc::now())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_manual_tick_dispatches_due_job() {
        let harness = TestHarness::new(ScriptedRunner::succeeding());
        let job = due_job(&harness).await;
        let (handle, task) = harness.scheduler().start().await;

        let dispatched = handle.tick(Trigger::OneTime).await.unwrap();

        assert_eq!(dispatched, 1);
        wait_for_status(&harness.store, &job.id, JobStatus::Completed).await;
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_trigger_fires_on_its_own() {
        let settings = SchedulerSettings {
            one_time_interval: Duration::from_millis(20),
            ..SchedulerSettings::for_tests()
        };
        let harness = TestHarness::new(ScriptedRunner::succeeding()).with_settings(settings);
        let job = due_job(&harness).await;
        let (handle, _task) = harness.scheduler().start().await;

        wait_for_status(&harness.store, &job.id, JobStatus::Completed).await;
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_and_resume_scheduler() {
        let settings = SchedulerSettings {
            one_time_interval: Duration::from_millis(20),
            ..SchedulerSettings::for_tests()
        };
        let harness = TestHarness::new(ScriptedRunner::succeeding()).with_settings(settings);
        let (handle, _task) = harness.scheduler().start().await;

        handle.pause().await.unwrap();
        assert!(handle.is_paused().await);
        let job = due_job(&harness).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            harness.store.get_job(&job.id).await.unwrap().status,
            JobStatus::Scheduled
        );

        handle.resume().await.unwrap();
        assert!(handle.is_running().await);
        wait_for_status(&harness.store, &job.id, JobStatus::Completed).await;
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_now_awaits_outcome() {
        let harness = TestHarness::new(ScriptedRunner::always_failing("exit 1"));
        let job = JobService::new(harness.store.clone())
            .create_one_time(
                Job::new("report", JobType::OneTime).with_max_retries(0),
                Utc::now() + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        let (handle, _task) = harness.scheduler().start().await;

        let outcome = handle.run_now(job.id).await.unwrap();

        assert!(matches!(outcome, Outcome::Failure(ref reason) if reason.contains("exit 1")));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_through_handle() {
        let harness = TestHarness::new(ScriptedRunner::succeeding());
        let job = due_job(&harness).await;
        let (handle, _task) = harness.scheduler().start().await;

        let cancelled = handle.cancel(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(handle.tick(Trigger::OneTime).await.unwrap(), 0);

        let missing = handle.cancel(JobId::new()).await.unwrap_err();
        assert!(matches!(missing, SchedulerError::JobNotFound(_)));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_jobs() {
        let harness = TestHarness::new(
            ScriptedRunner::succeeding().with_delay(Duration::from_millis(200)),
        );
        let job = due_job(&harness).await;
        let (handle, task) = harness.scheduler().start().await;

        assert_eq!(handle.tick(Trigger::OneTime).await.unwrap(), 1);
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert_eq!(handle.state().await, SchedulerState::Stopped);
        assert_eq!(
            harness.store.get_job(&job.id).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_commands_fail_after_shutdown() {
        let harness = TestHarness::new(ScriptedRunner::succeeding());
        let (handle, task) = harness.scheduler().start().await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(matches!(
            handle.pause().await,
            Err(SchedulerError::ChannelError(_))
        ));
    }
}
