use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use hub_core::ids::{RunId, ThreadId};
use hub_core::run::{RunMode, RunStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRow {
    pub id: RunId,
    pub thread_id: ThreadId,
    pub agent_id: String,
    pub model: Option<String>,
    pub status: RunStatus,
    pub instructions: Option<String>,
    pub tools: serde_json::Value,
    pub max_iterations: u32,
    /// Weak reference used for lookup only; chaining depth is capped at one.
    pub parent_run_id: Option<RunId>,
    /// Append-only.
    pub child_run_ids: Vec<RunId>,
    pub run_mode: RunMode,
    pub last_error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub failed_at: Option<String>,
    pub cancelled_at: Option<String>,
}

/// Everything needed to insert a new run.
pub struct NewRun<'a> {
    pub thread_id: &'a ThreadId,
    pub agent_id: &'a str,
    pub model: Option<&'a str>,
    pub instructions: Option<&'a str>,
    pub tools: serde_json::Value,
    pub max_iterations: u32,
    pub parent_run_id: Option<&'a RunId>,
    pub run_mode: RunMode,
}

pub struct RunRepo {
    db: Database,
}

impl RunRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a run in status `queued`.
    ///
    /// Enforces the one-level chaining invariant at the storage layer: if
    /// `parent_run_id` points at a run that itself has a parent, the insert
    /// is rejected with `Conflict`.
    #[instrument(skip(self, new), fields(thread_id = %new.thread_id, agent_id = %new.agent_id))]
    pub fn create(&self, new: NewRun<'_>) -> Result<RunRow, StoreError> {
        let id = RunId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            if let Some(parent_id) = new.parent_run_id {
                let grandparent: Option<Option<String>> = conn
                    .query_row(
                        "SELECT parent_run_id FROM runs WHERE id = ?1",
                        [parent_id.as_str()],
                        |row| row.get(0),
                    )
                    .ok();
                match grandparent {
                    None => {
                        return Err(StoreError::NotFound(format!("run {parent_id}")));
                    }
                    Some(Some(_)) => {
                        return Err(StoreError::Conflict(
                            "parent run cannot itself be a child run".into(),
                        ));
                    }
                    Some(None) => {}
                }
            }

            conn.execute(
                "INSERT INTO runs (id, thread_id, agent_id, model, status, instructions, tools,
                                   max_iterations, parent_run_id, child_run_ids, run_mode, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7, ?8, '[]', ?9, ?10)",
                rusqlite::params![
                    id.as_str(),
                    new.thread_id.as_str(),
                    new.agent_id,
                    new.model,
                    new.instructions,
                    serde_json::to_string(&new.tools)?,
                    new.max_iterations,
                    new.parent_run_id.map(|p| p.as_str()),
                    new.run_mode.to_string(),
                    now,
                ],
            )?;

            Ok(RunRow {
                id,
                thread_id: new.thread_id.clone(),
                agent_id: new.agent_id.to_string(),
                model: new.model.map(str::to_string),
                status: RunStatus::Queued,
                instructions: new.instructions.map(str::to_string),
                tools: new.tools,
                max_iterations: new.max_iterations,
                parent_run_id: new.parent_run_id.cloned(),
                child_run_ids: Vec::new(),
                run_mode: new.run_mode,
                last_error: None,
                created_at: now,
                started_at: None,
                completed_at: None,
                failed_at: None,
                cancelled_at: None,
            })
        })
    }

    #[instrument(skip(self), fields(run_id = %id))]
    pub fn get(&self, id: &RunId) -> Result<RunRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, agent_id, model, status, instructions, tools,
                        max_iterations, parent_run_id, child_run_ids, run_mode, last_error,
                        created_at, started_at, completed_at, failed_at, cancelled_at
                 FROM runs WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_run(row),
                None => Err(StoreError::NotFound(format!("run {id}"))),
            }
        })
    }

    /// Advance a run's status. The state machine is forward-only; attempting
    /// to leave a terminal status (or skip ahead illegally) is a `Conflict`.
    /// Stamps the timestamp matching the new status and records `last_error`
    /// when moving to `failed`.
    #[instrument(skip(self, last_error), fields(run_id = %id, status = %to))]
    pub fn update_status(
        &self,
        id: &RunId,
        to: RunStatus,
        last_error: Option<&str>,
    ) -> Result<RunRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let current: String = conn
                .query_row("SELECT status FROM runs WHERE id = ?1", [id.as_str()], |row| {
                    row.get(0)
                })
                .map_err(|_| StoreError::NotFound(format!("run {id}")))?;
            let current: RunStatus = row_helpers::parse_enum(&current, "runs", "status")?;

            if !current.can_transition(to) {
                return Err(StoreError::Conflict(format!(
                    "run {id} cannot move {current} -> {to}"
                )));
            }

            let stamp_column = match to {
                RunStatus::InProgress => Some("started_at"),
                RunStatus::Completed | RunStatus::RequiresAction => Some("completed_at"),
                RunStatus::Failed | RunStatus::Expired => Some("failed_at"),
                RunStatus::Cancelled => Some("cancelled_at"),
                RunStatus::Queued => None,
            };

            match stamp_column {
                Some(col) => conn.execute(
                    &format!(
                        "UPDATE runs SET status = ?1, {col} = ?2, last_error = COALESCE(?3, last_error)
                         WHERE id = ?4"
                    ),
                    rusqlite::params![to.to_string(), now, last_error, id.as_str()],
                )?,
                None => conn.execute(
                    "UPDATE runs SET status = ?1 WHERE id = ?2",
                    rusqlite::params![to.to_string(), id.as_str()],
                )?,
            };
            Ok(())
        })?;
        self.get(id)
    }

    /// Append a child run id to the parent's list. Append-only; duplicates
    /// are ignored so a retried chain call stays idempotent.
    #[instrument(skip(self), fields(parent = %parent_id, child = %child_id))]
    pub fn append_child(&self, parent_id: &RunId, child_id: &RunId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let raw: String = conn
                .query_row(
                    "SELECT child_run_ids FROM runs WHERE id = ?1",
                    [parent_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|_| StoreError::NotFound(format!("run {parent_id}")))?;
            let mut children: Vec<String> = serde_json::from_str(&raw)?;
            if !children.iter().any(|c| c == child_id.as_str()) {
                children.push(child_id.as_str().to_string());
            }
            conn.execute(
                "UPDATE runs SET child_run_ids = ?1 WHERE id = ?2",
                rusqlite::params![serde_json::to_string(&children)?, parent_id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn list_for_thread(&self, thread_id: &ThreadId) -> Result<Vec<RunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, agent_id, model, status, instructions, tools,
                        max_iterations, parent_run_id, child_run_ids, run_mode, last_error,
                        created_at, started_at, completed_at, failed_at, cancelled_at
                 FROM runs WHERE thread_id = ?1 ORDER BY created_at ASC",
            )?;
            let mut rows = stmt.query([thread_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_run(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<RunRow, StoreError> {
    let status_str: String = row_helpers::get(row, 4, "runs", "status")?;
    let tools_str: String = row_helpers::get(row, 6, "runs", "tools")?;
    let children_str: String = row_helpers::get(row, 9, "runs", "child_run_ids")?;
    let mode_str: String = row_helpers::get(row, 10, "runs", "run_mode")?;
    let children: Vec<String> = serde_json::from_str(&children_str).map_err(|e| {
        StoreError::CorruptRow {
            table: "runs",
            column: "child_run_ids",
            detail: e.to_string(),
        }
    })?;

    Ok(RunRow {
        id: RunId::from_raw(row_helpers::get::<String>(row, 0, "runs", "id")?),
        thread_id: ThreadId::from_raw(row_helpers::get::<String>(row, 1, "runs", "thread_id")?),
        agent_id: row_helpers::get(row, 2, "runs", "agent_id")?,
        model: row_helpers::get_opt(row, 3, "runs", "model")?,
        status: row_helpers::parse_enum(&status_str, "runs", "status")?,
        instructions: row_helpers::get_opt(row, 5, "runs", "instructions")?,
        tools: row_helpers::parse_json(&tools_str, "runs", "tools")?,
        max_iterations: row_helpers::get::<i64>(row, 7, "runs", "max_iterations")? as u32,
        parent_run_id: row_helpers::get_opt::<String>(row, 8, "runs", "parent_run_id")?
            .map(RunId::from_raw),
        child_run_ids: children.into_iter().map(RunId::from_raw).collect(),
        run_mode: row_helpers::parse_enum(&mode_str, "runs", "run_mode")?,
        last_error: row_helpers::get_opt(row, 11, "runs", "last_error")?,
        created_at: row_helpers::get(row, 12, "runs", "created_at")?,
        started_at: row_helpers::get_opt(row, 13, "runs", "started_at")?,
        completed_at: row_helpers::get_opt(row, 14, "runs", "completed_at")?,
        failed_at: row_helpers::get_opt(row, 15, "runs", "failed_at")?,
        cancelled_at: row_helpers::get_opt(row, 16, "runs", "cancelled_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::ThreadRepo;
    use serde_json::json;

    fn setup() -> (Database, ThreadId) {
        let db = Database::in_memory().unwrap();
        let threads = ThreadRepo::new(db.clone());
        let thread = threads.create("user-1", json!({}), None).unwrap();
        (db, thread.id)
    }

    fn new_run<'a>(thread_id: &'a ThreadId, parent: Option<&'a RunId>) -> NewRun<'a> {
        NewRun {
            thread_id,
            agent_id: "demo.agent",
            model: None,
            instructions: None,
            tools: json!([]),
            max_iterations: 10,
            parent_run_id: parent,
            run_mode: RunMode::Simple,
        }
    }

    #[test]
    fn create_run_starts_queued() {
        let (db, thread_id) = setup();
        let repo = RunRepo::new(db);
        let run = repo.create(new_run(&thread_id, None)).unwrap();
        assert!(run.id.as_str().starts_with("run_"));
        assert_eq!(run.status, RunStatus::Queued);
        assert!(run.started_at.is_none());
        assert!(run.child_run_ids.is_empty());
    }

    #[test]
    fn status_advances_and_stamps() {
        let (db, thread_id) = setup();
        let repo = RunRepo::new(db);
        let run = repo.create(new_run(&thread_id, None)).unwrap();

        let run = repo.update_status(&run.id, RunStatus::InProgress, None).unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
        assert!(run.started_at.is_some());

        let run = repo.update_status(&run.id, RunStatus::Completed, None).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn terminal_status_is_frozen() {
        let (db, thread_id) = setup();
        let repo = RunRepo::new(db);
        let run = repo.create(new_run(&thread_id, None)).unwrap();
        repo.update_status(&run.id, RunStatus::InProgress, None).unwrap();
        repo.update_status(&run.id, RunStatus::Failed, Some("boom")).unwrap();

        for to in [RunStatus::InProgress, RunStatus::Completed, RunStatus::Queued] {
            let result = repo.update_status(&run.id, to, None);
            assert!(matches!(result, Err(StoreError::Conflict(_))), "{to}");
        }

        let fetched = repo.get(&run.id).unwrap();
        assert_eq!(fetched.status, RunStatus::Failed);
        assert_eq!(fetched.last_error.as_deref(), Some("boom"));
        assert!(fetched.failed_at.is_some());
    }

    #[test]
    fn queued_cannot_jump_to_completed() {
        let (db, thread_id) = setup();
        let repo = RunRepo::new(db);
        let run = repo.create(new_run(&thread_id, None)).unwrap();
        let result = repo.update_status(&run.id, RunStatus::Completed, None);
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn one_level_chaining_enforced() {
        let (db, thread_id) = setup();
        let repo = RunRepo::new(db);
        let parent = repo.create(new_run(&thread_id, None)).unwrap();
        let child = repo.create(new_run(&thread_id, Some(&parent.id))).unwrap();
        assert_eq!(child.parent_run_id.as_ref().unwrap(), &parent.id);

        // The child already has a parent; it may never become a parent itself.
        let result = repo.create(new_run(&thread_id, Some(&child.id)));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn missing_parent_is_not_found() {
        let (db, thread_id) = setup();
        let repo = RunRepo::new(db);
        let ghost = RunId::from_raw("run_ghost");
        let result = repo.create(new_run(&thread_id, Some(&ghost)));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn append_child_is_idempotent() {
        let (db, thread_id) = setup();
        let repo = RunRepo::new(db);
        let parent = repo.create(new_run(&thread_id, None)).unwrap();
        let child = repo.create(new_run(&thread_id, Some(&parent.id))).unwrap();

        repo.append_child(&parent.id, &child.id).unwrap();
        repo.append_child(&parent.id, &child.id).unwrap();

        let fetched = repo.get(&parent.id).unwrap();
        assert_eq!(fetched.child_run_ids, vec![child.id]);
    }

    #[test]
    fn update_unknown_run_is_not_found() {
        let (db, _) = setup();
        let repo = RunRepo::new(db);
        let result = repo.update_status(&RunId::from_raw("run_missing"), RunStatus::InProgress, None);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_for_thread() {
        let (db, thread_id) = setup();
        let repo = RunRepo::new(db);
        repo.create(new_run(&thread_id, None)).unwrap();
        repo.create(new_run(&thread_id, None)).unwrap();
        assert_eq!(repo.list_for_thread(&thread_id).unwrap().len(), 2);
    }

    #[test]
    fn run_mode_round_trips_through_db() {
        let (db, thread_id) = setup();
        let repo = RunRepo::new(db);
        let mut new = new_run(&thread_id, None);
        new.run_mode = RunMode::WithCallback;
        let run = repo.create(new).unwrap();
        let fetched = repo.get(&run.id).unwrap();
        assert_eq!(fetched.run_mode, RunMode::WithCallback);
    }
}
