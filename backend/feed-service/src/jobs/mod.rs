//! Background task arena
//!
//! Every long-lived task (periodic jobs, broker listeners) is spawned through
//! a [`TaskArena`] and shares its shutdown signal. A periodic job either runs
//! a whole cycle or none: shutdown is only observed between ticks.

pub mod counter_sync;

pub use counter_sync::{SyncState, UserCounterSyncJob};

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::metrics;

#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Run one full cycle, returning how many items it handled.
    async fn run_once(&self) -> Result<usize>;

    /// Whether the first cycle runs immediately instead of after one interval
    fn run_on_start(&self) -> bool {
        false
    }
}

pub struct TaskArena {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Default for TaskArena {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskArena {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Receiver that flips to `true` once shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn a task that watches [`TaskArena::shutdown_signal`] itself.
    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        info!(task = %name, "Starting background task");
        self.tasks.push((name, tokio::spawn(task)));
    }

    pub fn spawn_periodic<J: PeriodicJob>(&mut self, job: Arc<J>) {
        let mut shutdown = self.shutdown_signal();
        let period = job.interval().max(Duration::from_millis(1));
        let start = if job.run_on_start() {
            tokio::time::Instant::now()
        } else {
            tokio::time::Instant::now() + period
        };

        let name = job.name();
        self.spawn(name, async move {
            let mut ticker = interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => run_cycle(job.as_ref()).await,
                }
            }
            info!(job = name, "Periodic job stopped");
        });
    }

    /// Signal every task and wait for all of them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                warn!(task = %name, error = %e, "Background task ended abnormally");
            }
        }
        info!("All background tasks stopped");
    }
}

async fn run_cycle<J: PeriodicJob + ?Sized>(job: &J) {
    let started = Instant::now();
    match job.run_once().await {
        Ok(handled) => {
            metrics::record_job_run(job.name(), "success", started.elapsed());
            info!(
                job = job.name(),
                handled,
                duration_ms = started.elapsed().as_millis() as u64,
                "Periodic job cycle completed"
            );
        }
        Err(e) => {
            metrics::record_job_run(job.name(), "error", started.elapsed());
            error!(
                job = job.name(),
                error = %e,
                duration_ms = started.elapsed().as_millis() as u64,
                "Periodic job cycle failed"
            );
        }
    }
}
