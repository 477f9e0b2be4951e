use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use hub_core::ids::{DeltaId, MessageId, RunId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A transient execution event written during a run and consumed by the
/// streaming bridge. The AUTOINCREMENT id is the streaming cursor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeltaRow {
    pub id: DeltaId,
    pub run_id: RunId,
    pub message_id: Option<MessageId>,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

#[derive(Clone)]
pub struct DeltaRepo {
    db: Database,
}

impl DeltaRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a delta; returns its monotonic id.
    #[instrument(skip(self, payload), fields(run_id = %run_id, kind = %kind))]
    pub fn append(
        &self,
        run_id: &RunId,
        message_id: Option<&MessageId>,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<DeltaId, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO deltas (run_id, message_id, kind, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    run_id.as_str(),
                    message_id.map(|m| m.as_str()),
                    kind,
                    serde_json::to_string(&payload)?,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Deltas for a run with id greater than `after_id`, ascending.
    /// This is the bridge's polling primitive.
    #[instrument(skip(self), fields(run_id = %run_id, after_id))]
    pub fn list_after(
        &self,
        run_id: &RunId,
        after_id: DeltaId,
        limit: u32,
    ) -> Result<Vec<DeltaRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, message_id, kind, payload, created_at
                 FROM deltas WHERE run_id = ?1 AND id > ?2
                 ORDER BY id ASC LIMIT ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![run_id.as_str(), after_id, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_delta(row)?);
            }
            Ok(results)
        })
    }

    /// Garbage-collect every delta for a run. Called by the bridge once the
    /// terminal event has been delivered and the grace period elapsed.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn delete_for_run(&self, run_id: &RunId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM deltas WHERE run_id = ?1", [run_id.as_str()])?;
            Ok(n)
        })
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn count(&self, run_id: &RunId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM deltas WHERE run_id = ?1",
                [run_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_delta(row: &rusqlite::Row<'_>) -> Result<DeltaRow, StoreError> {
    let payload_str: String = row_helpers::get(row, 4, "deltas", "payload")?;
    Ok(DeltaRow {
        id: row_helpers::get(row, 0, "deltas", "id")?,
        run_id: RunId::from_raw(row_helpers::get::<String>(row, 1, "deltas", "run_id")?),
        message_id: row_helpers::get_opt::<String>(row, 2, "deltas", "message_id")?
            .map(MessageId::from_raw),
        kind: row_helpers::get(row, 3, "deltas", "kind")?,
        payload: row_helpers::parse_json(&payload_str, "deltas", "payload")?,
        created_at: row_helpers::get(row, 5, "deltas", "created_at")?,
    })
}
