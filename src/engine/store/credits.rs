// Ledger rows: credit transactions (append-only), monthly snapshots, and
// reservations. The atomic read-check-write paths live here because they
// must run inside one store transaction; the Ledger component layers
// caching, snapshot maintenance, and retries on top.

use super::{parse_ts, ts, Store};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CreditTransaction, MonthlySnapshot, Reservation, TransactionKind};
use chrono::{DateTime, Utc};
use log::warn;
use rusqlite::{params, Connection, OptionalExtension};

/// SQLite reports unique-index collisions as constraint violations; the
/// idempotent grant paths turn those into domain conflicts.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Balance at `now`: latest snapshot at or before now, plus transactions
/// since the snapshot month, minus unexpired reservations.
fn compute_balance(conn: &Connection, user_id: &str, now: DateTime<Utc>) -> rusqlite::Result<i64> {
    let snapshot: Option<(String, i64)> = conn
        .query_row(
            "SELECT month_start, starting_balance FROM monthly_snapshots
             WHERE user_id = ?1 AND month_start <= ?2
             ORDER BY month_start DESC LIMIT 1",
            params![user_id, ts(now)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (since, base) = snapshot.unwrap_or_default();

    let delta: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM credit_transactions
         WHERE user_id = ?1 AND created_at >= ?2",
        params![user_id, since],
        |row| row.get(0),
    )?;

    let reserved: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM reservations
         WHERE user_id = ?1 AND expires_at > ?2",
        params![user_id, ts(now)],
        |row| row.get(0),
    )?;

    Ok(base + delta - reserved)
}

fn insert_tx_row(
    conn: &Connection,
    tx: &CreditTransaction,
    reward_day: Option<&str>,
    grant_period: Option<&str>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO credit_transactions
            (id, user_id, kind, amount, notes, related_usage_id, related_plan_id,
             reward_day, grant_period, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            tx.id,
            tx.user_id,
            tx.kind.as_str(),
            tx.amount,
            tx.notes,
            tx.related_usage_id,
            tx.related_plan_id,
            reward_day,
            grant_period,
            ts(tx.created_at),
        ],
    )
}

impl Store {
    /// Uncached balance read at `now`.
    pub fn balance_at(&self, user_id: &str, now: DateTime<Utc>) -> EngineResult<i64> {
        let conn = self.conn.lock();
        Ok(compute_balance(&conn, user_id, now)?)
    }

    /// Append a (positive) grant row. `reward_day` / `grant_period` engage
    /// the unique indexes; a collision surfaces as Conflict.
    pub fn insert_transaction(
        &self,
        tx: &CreditTransaction,
        reward_day: Option<&str>,
        grant_period: Option<&str>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        match insert_tx_row(&conn, tx, reward_day, grant_period) {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(EngineError::Conflict(format!(
                "duplicate {} grant for {}",
                tx.kind.as_str(),
                tx.user_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Debit `amount` iff the balance covers it, atomically with the read.
    pub fn consume_atomic(
        &self,
        debit: &CreditTransaction,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        debug_assert!(debit.amount <= 0, "consumption rows are negative");
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let available = compute_balance(&tx, &debit.user_id, now)?;
        let required = -debit.amount;
        if available < required {
            return Err(EngineError::InsufficientCredits {
                required,
                available,
            });
        }

        insert_tx_row(&tx, debit, None, None)?;
        tx.commit()?;
        Ok(())
    }

    /// Place a hold iff the balance covers it, atomically with the read.
    pub fn reserve_atomic(
        &self,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let available = compute_balance(&tx, &reservation.user_id, now)?;
        if available < reservation.amount {
            return Err(EngineError::InsufficientCredits {
                required: reservation.amount,
                available,
            });
        }

        tx.execute(
            "INSERT INTO reservations (id, user_id, amount, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                reservation.id,
                reservation.user_id,
                reservation.amount,
                ts(reservation.expires_at),
                ts(reservation.created_at),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Release the hold and write the final consumption in one transaction.
    /// The consumption is clamped to the post-release balance so the ledger
    /// can never go negative even when `actual` overruns the estimate.
    /// Returns the amount actually consumed.
    pub fn settle_reservation_atomic(
        &self,
        reservation_id: &str,
        actual: i64,
        debit_template: &CreditTransaction,
        now: DateTime<Utc>,
    ) -> EngineResult<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let found: Option<String> = tx
            .query_row(
                "SELECT user_id FROM reservations WHERE id = ?1",
                params![reservation_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(user_id) = found else {
            return Err(EngineError::NotFound(format!(
                "reservation {reservation_id}"
            )));
        };

        tx.execute(
            "DELETE FROM reservations WHERE id = ?1",
            params![reservation_id],
        )?;

        if actual <= 0 {
            tx.commit()?;
            return Ok(0);
        }

        let available = compute_balance(&tx, &user_id, now)?;
        let charged = actual.min(available).max(0);
        if charged < actual {
            warn!(
                "[store] Settlement for {} clamped from {} to {} credits",
                user_id, actual, charged
            );
        }
        if charged > 0 {
            let mut debit = debit_template.clone();
            debit.amount = -charged;
            insert_tx_row(&tx, &debit, None, None)?;
        }
        tx.commit()?;
        Ok(charged)
    }

    /// Drop the hold without consuming. Idempotent: releasing an unknown or
    /// already-expired reservation is a no-op.
    pub fn release_reservation(&self, reservation_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM reservations WHERE id = ?1",
            params![reservation_id],
        )?;
        Ok(())
    }

    /// Expired holds stop counting on read; this removes the rows.
    pub fn purge_expired_reservations(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let purged = conn.execute(
            "DELETE FROM reservations WHERE expires_at <= ?1",
            params![ts(now)],
        )?;
        Ok(purged)
    }

    // ── Snapshots ──────────────────────────────────────────────────────

    pub fn latest_snapshot(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> EngineResult<Option<MonthlySnapshot>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT user_id, month_start, starting_balance FROM monthly_snapshots
                 WHERE user_id = ?1 AND month_start <= ?2
                 ORDER BY month_start DESC LIMIT 1",
                params![user_id, ts(at)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(user_id, month_start, starting_balance)| MonthlySnapshot {
            user_id,
            month_start: parse_ts(&month_start),
            starting_balance,
        }))
    }

    /// Insert the snapshot if absent. Returns true when a row was written.
    pub fn insert_snapshot_if_absent(&self, snap: &MonthlySnapshot) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO monthly_snapshots (user_id, month_start, starting_balance)
             VALUES (?1, ?2, ?3)",
            params![snap.user_id, ts(snap.month_start), snap.starting_balance],
        )?;
        Ok(inserted > 0)
    }

    /// Signed sum of transactions in (from, to]; used by snapshot builds.
    pub fn sum_transactions_between(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let sum = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM credit_transactions
             WHERE user_id = ?1 AND created_at >= ?2 AND created_at < ?3",
            params![user_id, ts(from), ts(to)],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    pub fn list_transactions(
        &self,
        user_id: &str,
        limit: i64,
    ) -> EngineResult<Vec<CreditTransaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, kind, amount, notes, related_usage_id, related_plan_id, created_at
             FROM credit_transactions WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut txs = Vec::with_capacity(rows.len());
        for (id, user_id, kind, amount, notes, usage, plan, created) in rows {
            txs.push(CreditTransaction {
                kind: TransactionKind::parse(&kind)
                    .ok_or_else(|| EngineError::Internal(format!("bad tx kind {kind}")))?,
                created_at: parse_ts(&created),
                id,
                user_id,
                amount,
                notes,
                related_usage_id: usage,
                related_plan_id: plan,
            });
        }
        Ok(txs)
    }
}
