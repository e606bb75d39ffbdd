//! Periodic task registration.
//!
//! A [`PeriodicScheduler`] owns a set of tasks that each run on their own
//! fixed-rate timer until the scheduler is shut down. Missed ticks are
//! skipped rather than replayed in a burst.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Work run on every tick of a periodic timer.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    async fn run(&self);
}

#[async_trait]
impl<F, Fut> PeriodicTask for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn run(&self) {
        (self)().await
    }
}

/// Runs registered tasks on independent timers.
pub struct PeriodicScheduler {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl PeriodicScheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Run `task` every `period`, first one period from now.
    pub fn register_periodic(
        &mut self,
        name: impl Into<String>,
        period: Duration,
        task: impl PeriodicTask,
    ) {
        let name = name.into();
        let period = period.max(Duration::from_millis(1));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::debug!(task = %task_name, period_ms = period.as_millis() as u64, "periodic task registered");

            loop {
                tokio::select! {
                    _ = ticker.tick() => task.run().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!(task = %task_name, "periodic task stopped");
        });

        self.tasks.push((name, handle));
    }

    /// Names of the registered tasks, in registration order.
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Stop every task and wait for in-progress runs to return.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                tracing::warn!(task = %name, error = %e, "periodic task ended abnormally");
            }
        }
    }
}

impl Default for PeriodicScheduler {
    fn default() -> Self {
        Self::new()
    }
}
