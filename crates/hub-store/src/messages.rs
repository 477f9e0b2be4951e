use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use hub_core::ids::{MessageId, RunId, ThreadId};
use hub_core::run::MessageRole;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub role: MessageRole,
    /// Ordered list of content blocks.
    pub content: serde_json::Value,
    pub attachments: Option<serde_json::Value>,
    /// The run that produced this message, if any.
    pub run_id: Option<RunId>,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message to a thread. Messages are immutable once created,
    /// apart from metadata patches.
    #[instrument(skip(self, content, attachments), fields(thread_id = %thread_id, role = %role))]
    pub fn create(
        &self,
        thread_id: &ThreadId,
        role: MessageRole,
        content: &str,
        attachments: Option<serde_json::Value>,
        run_id: Option<&RunId>,
    ) -> Result<MessageRow, StoreError> {
        let id = MessageId::new();
        let now = Utc::now().to_rfc3339();
        // Empty content is never stored; substitute a single space.
        let text = if content.is_empty() { " " } else { content };
        let blocks = serde_json::json!([{"type": "text", "text": text}]);

        self.db.with_conn(|conn| {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM threads WHERE id = ?1",
                    [thread_id.as_str()],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if !exists {
                return Err(StoreError::NotFound(format!("thread {thread_id}")));
            }

            conn.execute(
                "INSERT INTO messages (id, thread_id, role, content, attachments, run_id, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, '{}', ?7)",
                rusqlite::params![
                    id.as_str(),
                    thread_id.as_str(),
                    role.to_string(),
                    serde_json::to_string(&blocks)?,
                    attachments
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    run_id.map(|r| r.as_str()),
                    now,
                ],
            )?;

            Ok(MessageRow {
                id,
                thread_id: thread_id.clone(),
                role,
                content: blocks,
                attachments,
                run_id: run_id.cloned(),
                metadata: serde_json::json!({}),
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    pub fn get(&self, id: &MessageId) -> Result<MessageRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, role, content, attachments, run_id, metadata, created_at
                 FROM messages WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_message(row),
                None => Err(StoreError::NotFound(format!("message {id}"))),
            }
        })
    }

    /// List messages for a thread in creation order.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn list(
        &self,
        thread_id: &ThreadId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, role, content, attachments, run_id, metadata, created_at
                 FROM messages WHERE thread_id = ?1
                 ORDER BY created_at ASC, id ASC LIMIT ?2 OFFSET ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![thread_id.as_str(), limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// Merge keys into the message's metadata map.
    #[instrument(skip(self, patch), fields(message_id = %id))]
    pub fn patch_metadata(
        &self,
        id: &MessageId,
        patch: serde_json::Value,
    ) -> Result<MessageRow, StoreError> {
        let mut message = self.get(id)?;
        if let (Some(base), Some(extra)) = (message.metadata.as_object_mut(), patch.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET metadata = ?1 WHERE id = ?2",
                rusqlite::params![serde_json::to_string(&message.metadata)?, id.as_str()],
            )?;
            Ok(())
        })?;
        Ok(message)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let role_str: String = row_helpers::get(row, 2, "messages", "role")?;
    let content_str: String = row_helpers::get(row, 3, "messages", "content")?;
    let metadata_str: String = row_helpers::get(row, 6, "messages", "metadata")?;
    let attachments = row_helpers::get_opt::<String>(row, 4, "messages", "attachments")?
        .map(|s| row_helpers::parse_json(&s, "messages", "attachments"))
        .transpose()?;

    Ok(MessageRow {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        thread_id: ThreadId::from_raw(row_helpers::get::<String>(row, 1, "messages", "thread_id")?),
        role: row_helpers::parse_enum(&role_str, "messages", "role")?,
        content: row_helpers::parse_json(&content_str, "messages", "content")?,
        attachments,
        run_id: row_helpers::get_opt::<String>(row, 5, "messages", "run_id")?.map(RunId::from_raw),
        metadata: row_helpers::parse_json(&metadata_str, "messages", "metadata")?,
        created_at: row_helpers::get(row, 7, "messages", "created_at")?,
    })
}
