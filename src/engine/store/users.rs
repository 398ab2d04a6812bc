use super::{parse_ts, ts, Store};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{AgeRating, User, UserRole};
use rusqlite::{params, OptionalExtension};

impl Store {
    pub fn upsert_user(&self, user: &User) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, preferred_language, role, max_age_rating, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                preferred_language = excluded.preferred_language,
                role = excluded.role,
                max_age_rating = excluded.max_age_rating",
            params![
                user.id,
                user.preferred_language,
                user.role.as_str(),
                user.max_age_rating.as_str(),
                ts(user.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> EngineResult<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, preferred_language, role, max_age_rating, created_at
             FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(RawUser {
                    id: row.get(0)?,
                    preferred_language: row.get(1)?,
                    role: row.get(2)?,
                    max_age_rating: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()?
        .map(RawUser::into_user)
        .transpose()
    }

    /// Load the user or fail with NotFound; the common ACL path.
    pub fn require_user(&self, user_id: &str) -> EngineResult<User> {
        self.get_user(user_id)?
            .ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))
    }
}

struct RawUser {
    id: String,
    preferred_language: String,
    role: String,
    max_age_rating: String,
    created_at: String,
}

impl RawUser {
    fn into_user(self) -> EngineResult<User> {
        Ok(User {
            role: UserRole::parse(&self.role)
                .ok_or_else(|| EngineError::Internal(format!("bad user role {}", self.role)))?,
            max_age_rating: AgeRating::parse(&self.max_age_rating).ok_or_else(|| {
                EngineError::Internal(format!("bad age rating {}", self.max_age_rating))
            })?,
            created_at: parse_ts(&self.created_at),
            id: self.id,
            preferred_language: self.preferred_language,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(id: &str) -> User {
        User {
            id: id.into(),
            preferred_language: "en".into(),
            role: UserRole::Free,
            max_age_rating: AgeRating::Teen,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_and_get_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_user(&user("u1")).unwrap();

        let loaded = store.get_user("u1").unwrap().unwrap();
        assert_eq!(loaded.id, "u1");
        assert_eq!(loaded.role, UserRole::Free);

        let mut updated = user("u1");
        updated.role = UserRole::Premium;
        store.upsert_user(&updated).unwrap();
        assert_eq!(
            store.get_user("u1").unwrap().unwrap().role,
            UserRole::Premium
        );
    }

    #[test]
    fn require_user_missing_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.require_user("ghost").unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
