// ── Relational store ───────────────────────────────────────────────────────
// SQLite via rusqlite behind one Mutex'ed connection. The store is the
// transactional boundary for the whole core: ledger writes, job claims, and
// message appends all serialize through it, which is what makes Consume and
// Claim atomic without row locks.
//
// Module layout:
//   schema         — idempotent migrations + seeded cost table
//   users          — user rows (the slice of the peripheral schema we need)
//   conversations  — conversation + participant rows
//   memberships    — membership rows (unique per (conversation, user))
//   messages       — append-only message log
//   credits        — credit transactions, monthly snapshots, reservations
//   usage          — append-only usage records + pricing updates
//   jobs           — queue-of-record for the job engine
//   plans          — plans, user plans, service costs, translations,
//                    character assets

use crate::atoms::error::EngineResult;
use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

mod characters;
pub use characters::{Character, CharacterImage};

mod conversations;
mod credits;
mod jobs;
mod memberships;
mod messages;
mod plans;
mod schema;
mod usage;
mod users;

/// Thread-safe database wrapper. Clones of `Store` are cheap handles onto the
/// same connection; callers hold the lock only for the duration of one call.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("[store] Opening store at {:?}", path);

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();

        schema::run_migrations(&conn)?;

        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store with the full schema. Used by tests.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        schema::run_migrations(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }
}

// ── Timestamp encoding ─────────────────────────────────────────────────────
// Fixed-width RFC 3339 with microseconds and a Z suffix, so lexical order in
// SQLite equals chronological order.

pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn opt_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().map(parse_ts)
}

/// Billing-period key for the plan-grant unique index.
pub fn encode_period(period_start: DateTime<Utc>) -> String {
    ts(period_start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_lexically() {
        let a = ts(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap());
        let b = ts(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 6).unwrap());
        assert!(a < b);
        assert_eq!(parse_ts(&a), Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap());
    }

    #[test]
    fn in_memory_store_opens() {
        Store::open_in_memory().unwrap();
    }
}
