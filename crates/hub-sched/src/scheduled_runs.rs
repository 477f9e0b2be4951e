use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use hub_core::run::RunParams;
use hub_core::OrchestratorError;
use hub_engine::engine::{CreateRunOutcome, CreateRunRequest, RunEngine};
use hub_store::scheduled::ScheduledRunRow;

const DUE_BATCH: u32 = 16;

/// Drains due scheduled run requests. Each row is claimed atomically before
/// execution, so concurrent pollers never double-fire a request.
pub struct SchedulePoller {
    engine: Arc<RunEngine>,
}

impl SchedulePoller {
    pub fn new(engine: Arc<RunEngine>) -> Self {
        Self { engine }
    }

    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<(), OrchestratorError> {
        let due = self.engine.schedules().list_due(Utc::now(), DUE_BATCH)?;
        for row in due {
            // Losing the claim race is normal, anything else is logged.
            match self.engine.schedules().claim(&row.id) {
                Ok(claimed) => {
                    if let Err(e) = self.fire(&claimed).await {
                        warn!(schedule_id = %claimed.id, error = %e, "scheduled run failed to fire");
                    }
                }
                Err(e) => {
                    warn!(schedule_id = %row.id, error = %e, "scheduled run claim lost");
                }
            }
        }
        Ok(())
    }

    async fn fire(&self, row: &ScheduledRunRow) -> Result<(), OrchestratorError> {
        let mut params: RunParams = serde_json::from_value(row.params.clone())
            .map_err(|e| OrchestratorError::Internal(format!("bad scheduled params: {e}")))?;
        // The deferral already happened; a second one would loop forever.
        params.schedule_at = None;
        let vars = params.user_env_vars.clone();

        let request = CreateRunRequest {
            caller_id: row.created_by.clone(),
            thread_id: row.thread_id.clone(),
            agent_id: Some(row.agent_id.clone()),
            assistant_id: None,
            new_message: (!row.input_text.is_empty()).then(|| row.input_text.clone()),
            params,
        };

        match self.engine.create_run(request).await? {
            CreateRunOutcome::Run(run) => {
                info!(schedule_id = %row.id, run_id = %run.id, "scheduled run fired");
                self.engine.execute(&run.id, &vars).await?;
                Ok(())
            }
            CreateRunOutcome::Scheduled(s) => Err(OrchestratorError::Internal(format!(
                "scheduled run {} re-deferred as {}",
                row.id, s.id
            ))),
        }
    }
}
