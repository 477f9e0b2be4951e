use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hub_core::OrchestratorError;

/// Per-job scheduling policy.
#[derive(Clone, Debug)]
pub struct JobConfig {
    pub name: String,
    pub interval: Duration,
    /// At most one instance of this job in flight at a time. Ticks that
    /// arrive while a previous run is still going are dropped.
    pub exclusive: bool,
    /// Missed ticks collapse into a single catch-up execution instead of
    /// firing once per missed interval.
    pub coalesce: bool,
    /// A tick this late still fires; later than this it is dropped
    /// (unless coalescing).
    pub grace: Duration,
}

impl JobConfig {
    pub fn every(name: &str, interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            interval,
            exclusive: false,
            coalesce: false,
            grace: interval,
        }
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn coalescing(mut self) -> Self {
        self.coalesce = true;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

type JobFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), OrchestratorError>> + Send + Sync>;

struct JobEntry {
    config: JobConfig,
    task: JobFn,
    handle: Option<JoinHandle<()>>,
}

/// Cooperative scheduler for named periodic jobs. Job errors are logged and
/// never stop the ticker; shutdown is cooperative via a cancellation token.
pub struct JobScheduler {
    jobs: Mutex<HashMap<String, JobEntry>>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl JobScheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            cancel,
            started: AtomicBool::new(false),
        }
    }

    /// Register a job. Registering under an existing name replaces the
    /// previous registration (and stops its ticker if already running).
    pub fn register<F>(&self, config: JobConfig, task: F)
    where
        F: Fn() -> BoxFuture<'static, Result<(), OrchestratorError>> + Send + Sync + 'static,
    {
        let name = config.name.clone();
        let mut jobs = self.jobs.lock();
        if let Some(previous) = jobs.remove(&name) {
            if let Some(handle) = previous.handle {
                debug!(job = %name, "replacing existing job registration");
                handle.abort();
            }
        }
        let mut entry = JobEntry {
            config,
            task: Arc::new(task),
            handle: None,
        };
        if self.started.load(Ordering::SeqCst) {
            entry.handle = Some(spawn_ticker(
                entry.config.clone(),
                entry.task.clone(),
                self.cancel.clone(),
            ));
        }
        jobs.insert(name, entry);
    }

    /// Start tickers for every registered job. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut jobs = self.jobs.lock();
        for entry in jobs.values_mut() {
            if entry.handle.is_none() {
                entry.handle = Some(spawn_ticker(
                    entry.config.clone(),
                    entry.task.clone(),
                    self.cancel.clone(),
                ));
            }
        }
        info!(jobs = jobs.len(), "scheduler started");
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.lock().keys().cloned().collect()
    }

    /// Stop all tickers. In-flight job executions finish on their own.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

fn spawn_ticker(config: JobConfig, task: JobFn, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(if config.coalesce {
            MissedTickBehavior::Delay
        } else {
            MissedTickBehavior::Skip
        });
        // The first tick of a tokio interval fires immediately; consume it
        // so jobs run one interval after startup.
        interval.tick().await;

        let in_flight = Arc::new(AtomicBool::new(false));
        let mut expected = Instant::now() + config.interval;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(job = %config.name, "ticker stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            let lateness = Instant::now().saturating_duration_since(expected);
            expected = Instant::now() + config.interval;
            if !config.coalesce && lateness > config.grace {
                debug!(job = %config.name, late_ms = lateness.as_millis() as u64, "dropping late tick");
                continue;
            }

            if config.exclusive && in_flight.load(Ordering::SeqCst) {
                debug!(job = %config.name, "previous execution still in flight, skipping tick");
                continue;
            }

            let name = config.name.clone();
            let task = task.clone();
            let in_flight = in_flight.clone();
            in_flight.store(true, Ordering::SeqCst);
            tokio::spawn(async move {
                if let Err(e) = task().await {
                    warn!(job = %name, error = %e, kind = e.error_kind(), "job tick failed");
                }
                in_flight.store(false, Ordering::SeqCst);
            });
        }
    })
}
