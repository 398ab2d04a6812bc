use super::{parse_ts, ts, Store};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ChatMessage, SenderKind};
use rusqlite::params;

impl Store {
    /// Append a message and bump the conversation's last_message_at in one
    /// transaction. Messages are immutable — there is no update path.
    pub fn append_message(&self, msg: &ChatMessage) -> EngineResult<()> {
        let content_json = serde_json::to_string(&msg.content)?;
        let attachments_json = if msg.attachments.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&msg.attachments)?)
        };
        let metadata_json = if msg.metadata.is_null() {
            None
        } else {
            Some(serde_json::to_string(&msg.metadata)?)
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO messages
                (id, conversation_id, sender_kind, sender_ref, content_json,
                 attachments_json, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.id,
                msg.conversation_id,
                msg.sender_kind.as_str(),
                msg.sender_ref,
                content_json,
                attachments_json,
                metadata_json,
                ts(msg.created_at),
            ],
        )?;
        tx.execute(
            "UPDATE conversations SET last_message_at = ?2 WHERE id = ?1",
            params![msg.conversation_id, ts(msg.created_at)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The most recent `limit` messages in conversation order (oldest first).
    /// Per-conversation order is strict by (created_at, id).
    pub fn recent_messages(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> EngineResult<Vec<ChatMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sender_kind, sender_ref, content_json,
                    attachments_json, metadata_json, created_at
             FROM (
                SELECT * FROM messages WHERE conversation_id = ?1
                ORDER BY created_at DESC, id DESC LIMIT ?2
             ) ORDER BY created_at ASC, id ASC",
        )?;

        let rows = stmt
            .query_map(params![conversation_id, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut messages = Vec::with_capacity(rows.len());
        for (id, conv, kind, sender_ref, content, attachments, metadata, created) in rows {
            messages.push(ChatMessage {
                sender_kind: SenderKind::parse(&kind)
                    .ok_or_else(|| EngineError::Internal(format!("bad sender kind {kind}")))?,
                content: serde_json::from_str(&content)?,
                attachments: attachments
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?
                    .unwrap_or_default(),
                metadata: metadata
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?
                    .unwrap_or(serde_json::Value::Null),
                created_at: parse_ts(&created),
                id,
                conversation_id: conv,
                sender_ref,
            });
        }
        Ok(messages)
    }
}
