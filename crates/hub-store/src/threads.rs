use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use hub_core::ids::ThreadId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadRow {
    pub id: ThreadId,
    pub owner_id: String,
    pub metadata: serde_json::Value,
    /// Non-owning back-reference for forked/derived threads.
    pub parent_id: Option<ThreadId>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ThreadRepo {
    db: Database,
}

impl ThreadRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new thread. The owner is fixed for the thread's lifetime.
    #[instrument(skip(self, metadata), fields(owner_id = %owner_id))]
    pub fn create(
        &self,
        owner_id: &str,
        metadata: serde_json::Value,
        parent_id: Option<&ThreadId>,
    ) -> Result<ThreadRow, StoreError> {
        let id = ThreadId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO threads (id, owner_id, metadata, parent_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    owner_id,
                    serde_json::to_string(&metadata)?,
                    parent_id.map(|p| p.as_str()),
                    now,
                    now,
                ],
            )?;

            Ok(ThreadRow {
                id,
                owner_id: owner_id.to_string(),
                metadata,
                parent_id: parent_id.cloned(),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(thread_id = %id))]
    pub fn get(&self, id: &ThreadId) -> Result<ThreadRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, metadata, parent_id, created_at, updated_at
                 FROM threads WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_thread(row),
                None => Err(StoreError::NotFound(format!("thread {id}"))),
            }
        })
    }

    /// List threads for an owner, newest first.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub fn list_for_owner(
        &self,
        owner_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ThreadRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, metadata, parent_id, created_at, updated_at
                 FROM threads WHERE owner_id = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![owner_id, limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_thread(row)?);
            }
            Ok(results)
        })
    }

    /// Merge keys into the thread's metadata map.
    #[instrument(skip(self, patch), fields(thread_id = %id))]
    pub fn patch_metadata(
        &self,
        id: &ThreadId,
        patch: serde_json::Value,
    ) -> Result<ThreadRow, StoreError> {
        let mut thread = self.get(id)?;
        if let (Some(base), Some(extra)) = (thread.metadata.as_object_mut(), patch.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE threads SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![serde_json::to_string(&thread.metadata)?, now, id.as_str()],
            )?;
            Ok(())
        })?;
        thread.updated_at = now;
        Ok(thread)
    }
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> Result<ThreadRow, StoreError> {
    let metadata_str: String = row_helpers::get(row, 2, "threads", "metadata")?;
    Ok(ThreadRow {
        id: ThreadId::from_raw(row_helpers::get::<String>(row, 0, "threads", "id")?),
        owner_id: row_helpers::get(row, 1, "threads", "owner_id")?,
        metadata: row_helpers::parse_json(&metadata_str, "threads", "metadata")?,
        parent_id: row_helpers::get_opt::<String>(row, 3, "threads", "parent_id")?
            .map(ThreadId::from_raw),
        created_at: row_helpers::get(row, 4, "threads", "created_at")?,
        updated_at: row_helpers::get(row, 5, "threads", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_thread() {
        let db = Database::in_memory().unwrap();
        let repo = ThreadRepo::new(db);
        let thread = repo.create("user-1", json!({"topic": "demo"}), None).unwrap();
        assert!(thread.id.as_str().starts_with("thr_"));
        assert_eq!(thread.owner_id, "user-1");
        assert!(thread.parent_id.is_none());
    }

    #[test]
    fn get_thread() {
        let db = Database::in_memory().unwrap();
        let repo = ThreadRepo::new(db);
        let thread = repo.create("user-1", json!({}), None).unwrap();
        let fetched = repo.get(&thread.id).unwrap();
        assert_eq!(fetched.id, thread.id);
        assert_eq!(fetched.owner_id, "user-1");
    }

    #[test]
    fn get_nonexistent_fails() {
        let db = Database::in_memory().unwrap();
        let repo = ThreadRepo::new(db);
        let result = repo.get(&ThreadId::from_raw("thr_nonexistent"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn forked_thread_keeps_parent_reference() {
        let db = Database::in_memory().unwrap();
        let repo = ThreadRepo::new(db);
        let base = repo.create("user-1", json!({}), None).unwrap();
        let fork = repo.create("user-1", json!({}), Some(&base.id)).unwrap();
        let fetched = repo.get(&fork.id).unwrap();
        assert_eq!(fetched.parent_id.as_ref().unwrap(), &base.id);
    }

    #[test]
    fn list_for_owner_filters() {
        let db = Database::in_memory().unwrap();
        let repo = ThreadRepo::new(db);
        repo.create("alice", json!({}), None).unwrap();
        repo.create("alice", json!({}), None).unwrap();
        repo.create("bob", json!({}), None).unwrap();

        assert_eq!(repo.list_for_owner("alice", 100, 0).unwrap().len(), 2);
        assert_eq!(repo.list_for_owner("bob", 100, 0).unwrap().len(), 1);
        assert!(repo.list_for_owner("carol", 100, 0).unwrap().is_empty());
    }

    #[test]
    fn patch_metadata_merges() {
        let db = Database::in_memory().unwrap();
        let repo = ThreadRepo::new(db);
        let thread = repo.create("user-1", json!({"a": 1}), None).unwrap();
        let patched = repo.patch_metadata(&thread.id, json!({"b": 2})).unwrap();
        assert_eq!(patched.metadata["a"], 1);
        assert_eq!(patched.metadata["b"], 2);

        let fetched = repo.get(&thread.id).unwrap();
        assert_eq!(fetched.metadata["b"], 2);
    }

    #[test]
    fn owner_never_changes() {
        // There is deliberately no API that updates owner_id; patching
        // metadata must not touch it.
        let db = Database::in_memory().unwrap();
        let repo = ThreadRepo::new(db);
        let thread = repo.create("user-1", json!({}), None).unwrap();
        repo.patch_metadata(&thread.id, json!({"owner_id": "mallory"})).unwrap();
        let fetched = repo.get(&thread.id).unwrap();
        assert_eq!(fetched.owner_id, "user-1");
    }
}
