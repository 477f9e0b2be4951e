use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use hub_core::ids::{ScheduleId, ThreadId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A deferred run request created by a caller or the ledger poller.
/// `has_run` flips false -> true exactly once; each row produces exactly
/// one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduledRunRow {
    pub id: ScheduleId,
    pub agent_id: String,
    pub input_text: String,
    pub thread_id: Option<ThreadId>,
    pub params: serde_json::Value,
    pub run_at: String,
    pub has_run: bool,
    pub created_by: String,
    pub created_at: String,
}

pub struct ScheduleRepo {
    db: Database,
}

impl ScheduleRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, params), fields(agent_id = %agent_id, run_at = %run_at))]
    pub fn create(
        &self,
        agent_id: &str,
        input_text: &str,
        thread_id: Option<&ThreadId>,
        params: serde_json::Value,
        run_at: DateTime<Utc>,
        created_by: &str,
    ) -> Result<ScheduledRunRow, StoreError> {
        let id = ScheduleId::new();
        let now = Utc::now().to_rfc3339();
        let run_at = run_at.to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scheduled_runs (id, agent_id, input_text, thread_id, params, run_at, has_run, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
                rusqlite::params![
                    id.as_str(),
                    agent_id,
                    input_text,
                    thread_id.map(|t| t.as_str()),
                    serde_json::to_string(&params)?,
                    run_at,
                    created_by,
                    now,
                ],
            )?;

            Ok(ScheduledRunRow {
                id,
                agent_id: agent_id.to_string(),
                input_text: input_text.to_string(),
                thread_id: thread_id.cloned(),
                params,
                run_at,
                has_run: false,
                created_by: created_by.to_string(),
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(schedule_id = %id))]
    pub fn get(&self, id: &ScheduleId) -> Result<ScheduledRunRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, agent_id, input_text, thread_id, params, run_at, has_run, created_by, created_at
                 FROM scheduled_runs WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_scheduled(row),
                None => Err(StoreError::NotFound(format!("scheduled run {id}"))),
            }
        })
    }

    /// Unclaimed requests whose `run_at` is at or before `now`, oldest first.
    #[instrument(skip(self))]
    pub fn list_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduledRunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, agent_id, input_text, thread_id, params, run_at, has_run, created_by, created_at
                 FROM scheduled_runs WHERE has_run = 0 AND run_at <= ?1
                 ORDER BY run_at ASC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![now.to_rfc3339(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_scheduled(row)?);
            }
            Ok(results)
        })
    }

    /// Atomically claim a request. The conditional UPDATE is the linearization
    /// point: exactly one claimer ever sees an affected row count of 1.
    #[instrument(skip(self), fields(schedule_id = %id))]
    pub fn claim(&self, id: &ScheduleId) -> Result<ScheduledRunRow, StoreError> {
        let claimed = self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE scheduled_runs SET has_run = 1 WHERE id = ?1 AND has_run = 0",
                [id.as_str()],
            )?;
            Ok(n)
        })?;

        if claimed == 0 {
            // Distinguish an absent row from an already-claimed one.
            let row = self.get(id)?;
            if row.has_run {
                return Err(StoreError::Conflict(format!(
                    "scheduled run {id} already claimed"
                )));
            }
            return Err(StoreError::Conflict(format!("scheduled run {id} not claimable")));
        }
        self.get(id)
    }
}

fn row_to_scheduled(row: &rusqlite::Row<'_>) -> Result<ScheduledRunRow, StoreError> {
    let params_str: String = row_helpers::get(row, 4, "scheduled_runs", "params")?;
    Ok(ScheduledRunRow {
        id: ScheduleId::from_raw(row_helpers::get::<String>(row, 0, "scheduled_runs", "id")?),
        agent_id: row_helpers::get(row, 1, "scheduled_runs", "agent_id")?,
        input_text: row_helpers::get(row, 2, "scheduled_runs", "input_text")?,
        thread_id: row_helpers::get_opt::<String>(row, 3, "scheduled_runs", "thread_id")?
            .map(ThreadId::from_raw),
        params: row_helpers::parse_json(&params_str, "scheduled_runs", "params")?,
        run_at: row_helpers::get(row, 5, "scheduled_runs", "run_at")?,
        has_run: row_helpers::get::<i64>(row, 6, "scheduled_runs", "has_run")? != 0,
        created_by: row_helpers::get(row, 7, "scheduled_runs", "created_by")?,
        created_at: row_helpers::get(row, 8, "scheduled_runs", "created_at")?,
    })
}
