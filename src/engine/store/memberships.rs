use super::{parse_ts, ts, Store};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Membership, MembershipRole};
use rusqlite::{params, OptionalExtension, Row};

fn membership_from_row(row: &Row<'_>) -> rusqlite::Result<(Membership, String)> {
    let role: String = row.get(2)?;
    Ok((
        Membership {
            conversation_id: row.get(0)?,
            user_id: row.get(1)?,
            role: MembershipRole::Member, // patched by caller from `role`
            can_write: row.get::<_, i64>(3)? != 0,
            can_invite: row.get::<_, i64>(4)? != 0,
            can_moderate: row.get::<_, i64>(5)? != 0,
            is_active: row.get::<_, i64>(6)? != 0,
            invited_by: row.get(7)?,
            joined_at: parse_ts(&row.get::<_, String>(8)?),
        },
        role,
    ))
}

fn finish(pair: (Membership, String)) -> EngineResult<Membership> {
    let (mut m, role) = pair;
    m.role = MembershipRole::parse(&role)
        .ok_or_else(|| EngineError::Internal(format!("bad membership role {role}")))?;
    Ok(m)
}

const SELECT_COLS: &str = "conversation_id, user_id, role, can_write, can_invite, \
                           can_moderate, is_active, invited_by, joined_at";

impl Store {
    /// Insert or overwrite the (conversation, user) membership row.
    /// Reactivation and permission changes go through here too.
    pub fn upsert_membership(&self, m: &Membership) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memberships
                (conversation_id, user_id, role, can_write, can_invite,
                 can_moderate, is_active, invited_by, joined_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(conversation_id, user_id) DO UPDATE SET
                role = excluded.role,
                can_write = excluded.can_write,
                can_invite = excluded.can_invite,
                can_moderate = excluded.can_moderate,
                is_active = excluded.is_active,
                invited_by = excluded.invited_by",
            params![
                m.conversation_id,
                m.user_id,
                m.role.as_str(),
                m.can_write as i64,
                m.can_invite as i64,
                m.can_moderate as i64,
                m.is_active as i64,
                m.invited_by,
                ts(m.joined_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_membership(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> EngineResult<Option<Membership>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLS} FROM memberships
                     WHERE conversation_id = ?1 AND user_id = ?2"
                ),
                params![conversation_id, user_id],
                membership_from_row,
            )
            .optional()?;
        row.map(finish).transpose()
    }

    pub fn list_memberships(&self, conversation_id: &str) -> EngineResult<Vec<Membership>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM memberships
             WHERE conversation_id = ?1 ORDER BY joined_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![conversation_id], membership_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish).collect()
    }

    pub fn count_active_members(&self, conversation_id: &str) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM memberships
             WHERE conversation_id = ?1 AND is_active = 1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn set_membership_active(
        &self,
        conversation_id: &str,
        user_id: &str,
        active: bool,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE memberships SET is_active = ?3
             WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id, user_id, active as i64],
        )?;
        if updated == 0 {
            return Err(EngineError::NotFound(format!(
                "membership {conversation_id}/{user_id}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::Conversation;
    use chrono::Utc;

    fn seed_conv(store: &Store, id: &str) {
        store
            .insert_conversation(&Conversation {
                id: id.into(),
                owner_user_id: "owner".into(),
                is_multi_user: true,
                max_users: 3,
                allow_user_invites: true,
                created_at: Utc::now(),
                last_message_at: None,
            })
            .unwrap();
    }

    fn member(conv: &str, user: &str, role: MembershipRole) -> Membership {
        Membership {
            conversation_id: conv.into(),
            user_id: user.into(),
            role,
            can_write: true,
            can_invite: false,
            can_moderate: role == MembershipRole::Owner,
            is_active: true,
            invited_by: None,
            joined_at: Utc::now(),
        }
    }

    #[test]
    fn unique_per_conversation_user() {
        let store = Store::open_in_memory().unwrap();
        seed_conv(&store, "c1");
        store
            .upsert_membership(&member("c1", "u1", MembershipRole::Member))
            .unwrap();
        // Second upsert overwrites rather than duplicating.
        store
            .upsert_membership(&member("c1", "u1", MembershipRole::Moderator))
            .unwrap();
        let all = store.list_memberships("c1").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].role, MembershipRole::Moderator);
    }

    #[test]
    fn active_member_count_tracks_deactivation() {
        let store = Store::open_in_memory().unwrap();
        seed_conv(&store, "c1");
        store
            .upsert_membership(&member("c1", "u1", MembershipRole::Owner))
            .unwrap();
        store
            .upsert_membership(&member("c1", "u2", MembershipRole::Member))
            .unwrap();
        assert_eq!(store.count_active_members("c1").unwrap(), 2);

        store.set_membership_active("c1", "u2", false).unwrap();
        assert_eq!(store.count_active_members("c1").unwrap(), 1);
    }
}
