use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use hub_core::events::{StreamEnvelope, OPENING_SEQUENCE, STEP_IN_PROGRESS};
use hub_core::ids::RunId;
use hub_core::run::RunStatus;
use hub_store::deltas::DeltaRepo;
use hub_store::runs::{RunRepo, RunRow};
use hub_store::Database;

#[derive(Clone, Debug)]
pub struct StreamerConfig {
    /// Hard ceiling on a single watcher's lifetime. Past it the stream ends
    /// with a synthesized `run.expired`.
    pub timeout: Duration,
    /// Wait before deleting a finished run's deltas, so a concurrent
    /// subscriber can still drain them.
    pub cleanup_grace: Duration,
    /// Sleep after an empty poll.
    pub poll_idle: Duration,
    /// Sleep between non-empty polls (fast drain).
    pub poll_busy: Duration,
    pub batch: u32,
    pub queue_depth: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            cleanup_grace: Duration::from_secs(5),
            poll_idle: Duration::from_millis(150),
            poll_busy: Duration::from_millis(15),
            batch: 64,
            queue_depth: 256,
        }
    }
}

/// Turns a run's persisted deltas into a live per-subscriber event stream.
///
/// Each subscriber gets its own watcher task and queue; watchers poll the
/// delta table independently and never coordinate. The terminal event is
/// held back until no deltas are pending, so it is always the last event
/// a subscriber sees.
pub struct RunStreamer {
    db: Database,
    config: StreamerConfig,
}

impl RunStreamer {
    pub fn new(db: Database, config: StreamerConfig) -> Self {
        Self { db, config }
    }

    /// Attach a subscriber to a run. The opening lifecycle events are
    /// queued synchronously so they are observable before any delta exists.
    /// With `delete_when_done` the watcher garbage-collects the run's deltas
    /// after the terminal event (plus a grace period).
    #[instrument(skip(self, run), fields(run_id = %run.id))]
    pub fn subscribe(
        &self,
        run: &RunRow,
        delete_when_done: bool,
    ) -> mpsc::Receiver<StreamEnvelope> {
        let (tx, rx) = mpsc::channel(self.config.queue_depth);

        let opening = json!({
            "run_id": run.id.as_str(),
            "thread_id": run.thread_id.as_str(),
            "agent_id": run.agent_id,
        });
        for kind in OPENING_SEQUENCE {
            // Queue depth always exceeds the opening sequence; try_send only
            // fails if the subscriber vanished already.
            let _ = tx.try_send(StreamEnvelope::new(kind, opening.clone()));
        }
        let _ = tx.try_send(StreamEnvelope::new(STEP_IN_PROGRESS, opening.clone()));

        let watcher = Watcher {
            deltas: DeltaRepo::new(self.db.clone()),
            runs: RunRepo::new(self.db.clone()),
            config: self.config.clone(),
            run_id: run.id.clone(),
            delete_when_done,
            tx,
        };
        tokio::spawn(watcher.run());
        rx
    }
}

struct Watcher {
    deltas: DeltaRepo,
    runs: RunRepo,
    config: StreamerConfig,
    run_id: RunId,
    delete_when_done: bool,
    tx: mpsc::Sender<StreamEnvelope>,
}

impl Watcher {
    async fn run(self) {
        let deadline = Instant::now() + self.config.timeout;
        let mut cursor = 0;
        let mut pending_terminal: Option<StreamEnvelope> = None;
        let mut delivered_terminal = false;

        loop {
            if Instant::now() >= deadline {
                self.expire().await;
                delivered_terminal = true;
                break;
            }

            let batch = match self.deltas.list_after(&self.run_id, cursor, self.config.batch) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(run_id = %self.run_id, error = %e, "delta poll failed");
                    tokio::time::sleep(self.config.poll_idle).await;
                    continue;
                }
            };

            if batch.is_empty() {
                // Nothing in flight. Deliver a held-back terminal, or detect
                // one from the run row.
                if let Some(terminal) = pending_terminal.take() {
                    let _ = self.tx.send(terminal).await;
                    delivered_terminal = true;
                    break;
                }
                match self.runs.get(&self.run_id) {
                    Ok(run) if run.status.is_terminal() => {
                        let data = json!({
                            "run_id": self.run_id.as_str(),
                            "status": run.status.to_string(),
                            "last_error": run.last_error,
                        });
                        let _ = self.tx.send(StreamEnvelope::terminal(run.status, data)).await;
                        delivered_terminal = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(run_id = %self.run_id, error = %e, "run lookup failed, closing stream");
                        break;
                    }
                }
                tokio::time::sleep(self.config.poll_idle).await;
                continue;
            }

            let full = batch.len() as u32 == self.config.batch;
            for delta in batch {
                cursor = delta.id;
                let envelope = StreamEnvelope::new(delta.kind.clone(), delta.payload);
                if envelope.is_terminal() {
                    // Hold back until the table is drained.
                    pending_terminal = Some(envelope);
                } else if self.tx.send(envelope).await.is_err() {
                    debug!(run_id = %self.run_id, "subscriber dropped, stopping watcher");
                    return;
                }
            }
            if full {
                tokio::time::sleep(self.config.poll_busy).await;
            }
        }

        // Close the subscriber's queue before the cleanup wait so its read
        // loop terminates as soon as the terminal event is consumed.
        let Watcher { deltas, config, run_id, delete_when_done, .. } = self;

        if delivered_terminal && delete_when_done {
            tokio::time::sleep(config.cleanup_grace).await;
            match deltas.delete_for_run(&run_id) {
                Ok(n) if n > 0 => debug!(run_id = %run_id, deleted = n, "deltas cleaned up"),
                Ok(_) => {}
                Err(e) => warn!(run_id = %run_id, error = %e, "delta cleanup failed"),
            }
        }
    }

    async fn expire(&self) {
        warn!(run_id = %self.run_id, "stream timeout, expiring run");
        // Best effort; the run may have reached a terminal state between
        // the deadline check and here.
        let _ = self.runs.update_status(&self.run_id, RunStatus::Expired, None);
        let data = json!({"run_id": self.run_id.as_str(), "status": "expired"});
        let _ = self.tx.send(StreamEnvelope::terminal(RunStatus::Expired, data)).await;
    }
}
