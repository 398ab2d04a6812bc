use super::{opt_ts, parse_ts, ts, Store};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Conversation, Participant, ParticipantKind};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<(Conversation, Option<String>)> {
    Ok((
        Conversation {
            id: row.get(0)?,
            owner_user_id: row.get(1)?,
            is_multi_user: row.get::<_, i64>(2)? != 0,
            max_users: row.get(3)?,
            allow_user_invites: row.get::<_, i64>(4)? != 0,
            created_at: parse_ts(&row.get::<_, String>(5)?),
            last_message_at: None,
        },
        row.get::<_, Option<String>>(6)?,
    ))
}

impl Store {
    pub fn insert_conversation(&self, conv: &Conversation) -> EngineResult<()> {
        if conv.is_multi_user && conv.max_users < 2 {
            return Err(EngineError::Validation(
                "multi-user conversation requires max_users >= 2".into(),
            ));
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversations
                (id, owner_user_id, is_multi_user, max_users, allow_user_invites, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conv.id,
                conv.owner_user_id,
                conv.is_multi_user as i64,
                conv.max_users,
                conv.allow_user_invites as i64,
                ts(conv.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_conversation(&self, id: &str) -> EngineResult<Option<Conversation>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, owner_user_id, is_multi_user, max_users, allow_user_invites,
                        created_at, last_message_at
                 FROM conversations WHERE id = ?1",
                params![id],
                conversation_from_row,
            )
            .optional()?;
        Ok(row.map(|(mut conv, last)| {
            conv.last_message_at = opt_ts(last);
            conv
        }))
    }

    pub fn require_conversation(&self, id: &str) -> EngineResult<Conversation> {
        self.get_conversation(id)?
            .ok_or_else(|| EngineError::NotFound(format!("conversation {id}")))
    }

    pub fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conversations SET last_message_at = ?2 WHERE id = ?1",
            params![id, ts(at)],
        )?;
        Ok(())
    }

    /// Atomic ownership transfer: flips owner_user_id and swaps the OWNER
    /// membership role in one transaction, preserving the single-OWNER
    /// invariant at every observable moment.
    pub fn transfer_ownership(
        &self,
        conversation_id: &str,
        from_user: &str,
        to_user: &str,
    ) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE conversations SET owner_user_id = ?3
             WHERE id = ?1 AND owner_user_id = ?2",
            params![conversation_id, from_user, to_user],
        )?;
        if updated == 0 {
            return Err(EngineError::Conflict(
                "ownership transfer requires the current owner".into(),
            ));
        }

        tx.execute(
            "UPDATE memberships SET role = 'moderator', can_moderate = 1
             WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id, from_user],
        )?;
        let promoted = tx.execute(
            "UPDATE memberships SET role = 'owner', can_write = 1, can_invite = 1,
                    can_moderate = 1, is_active = 1
             WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id, to_user],
        )?;
        if promoted == 0 {
            return Err(EngineError::Conflict(
                "new owner must already be a member".into(),
            ));
        }

        tx.commit()?;
        Ok(())
    }

    // ── Participants ───────────────────────────────────────────────────

    pub fn insert_participant(&self, p: &Participant) -> EngineResult<()> {
        match p.kind {
            ParticipantKind::User if p.user_id.is_none() => {
                return Err(EngineError::Validation(
                    "user participant must bind a user id".into(),
                ))
            }
            ParticipantKind::Assistant if p.represented_character_id.is_none() => {
                return Err(EngineError::Validation(
                    "assistant participant must represent a character".into(),
                ))
            }
            _ => {}
        }

        let llm_profile_json = p
            .llm_profile
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let config_json = p
            .config_override
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO participants
                (id, conversation_id, kind, user_id, represented_character_id,
                 display_name, llm_profile_json, config_override_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                p.id,
                p.conversation_id,
                p.kind.as_str(),
                p.user_id,
                p.represented_character_id,
                p.display_name,
                llm_profile_json,
                config_json,
                ts(p.created_at),
            ],
        )?;
        Ok(())
    }

    /// Participants in declared order (created_at asc, id asc) — the order
    /// responders fire in.
    pub fn list_participants(&self, conversation_id: &str) -> EngineResult<Vec<Participant>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, kind, user_id, represented_character_id,
                    display_name, llm_profile_json, config_override_json, created_at
             FROM participants WHERE conversation_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;

        let rows = stmt
            .query_map(params![conversation_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut participants = Vec::with_capacity(rows.len());
        for (id, conv, kind, user_id, char_id, name, llm_json, cfg_json, created) in rows {
            participants.push(Participant {
                kind: ParticipantKind::parse(&kind)
                    .ok_or_else(|| EngineError::Internal(format!("bad participant kind {kind}")))?,
                llm_profile: llm_json.as_deref().map(serde_json::from_str).transpose()?,
                config_override: cfg_json.as_deref().map(serde_json::from_str).transpose()?,
                created_at: parse_ts(&created),
                id,
                conversation_id: conv,
                user_id,
                represented_character_id: char_id,
                display_name: name,
            });
        }
        Ok(participants)
    }

    pub fn get_participant(&self, id: &str) -> EngineResult<Option<Participant>> {
        let conn = self.conn.lock();
        let conv_id: Option<String> = conn
            .query_row(
                "SELECT conversation_id FROM participants WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);

        let Some(conv_id) = conv_id else {
            return Ok(None);
        };
        Ok(self
            .list_participants(&conv_id)?
            .into_iter()
            .find(|p| p.id == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn conv(id: &str, multi: bool, max_users: i64) -> Conversation {
        Conversation {
            id: id.into(),
            owner_user_id: "owner".into(),
            is_multi_user: multi,
            max_users,
            allow_user_invites: true,
            created_at: Utc::now(),
            last_message_at: None,
        }
    }

    #[test]
    fn multi_user_requires_two_seats() {
        let store = Store::open_in_memory().unwrap();
        let err = store.insert_conversation(&conv("c1", true, 1)).unwrap_err();
        assert_eq!(err.code(), "validation_error");
        store.insert_conversation(&conv("c2", true, 2)).unwrap();
    }

    #[test]
    fn participants_listed_in_declared_order() {
        let store = Store::open_in_memory().unwrap();
        store.insert_conversation(&conv("c1", false, 1)).unwrap();

        let base = Utc::now();
        for (i, name) in ["Alice", "Bob", "Cleo"].iter().enumerate() {
            store
                .insert_participant(&Participant {
                    id: format!("p{i}"),
                    conversation_id: "c1".into(),
                    kind: ParticipantKind::CharacterDirect,
                    user_id: None,
                    represented_character_id: Some(format!("char{i}")),
                    display_name: name.to_string(),
                    llm_profile: None,
                    config_override: None,
                    created_at: base + chrono::Duration::seconds(i as i64),
                })
                .unwrap();
        }

        let names: Vec<String> = store
            .list_participants("c1")
            .unwrap()
            .into_iter()
            .map(|p| p.display_name)
            .collect();
        assert_eq!(names, vec!["Alice", "Bob", "Cleo"]);
    }

    #[test]
    fn assistant_must_represent_character() {
        let store = Store::open_in_memory().unwrap();
        store.insert_conversation(&conv("c1", false, 1)).unwrap();
        let err = store
            .insert_participant(&Participant {
                id: "p1".into(),
                conversation_id: "c1".into(),
                kind: ParticipantKind::Assistant,
                user_id: None,
                represented_character_id: None,
                display_name: "Ghost".into(),
                llm_profile: None,
                config_override: None,
                created_at: Utc::now(),
            })
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }
}
