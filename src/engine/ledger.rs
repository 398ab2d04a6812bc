// ── Credit ledger ──────────────────────────────────────────────────────────
// Authoritative balance service. Balances derive from the latest monthly
// snapshot plus transactions since, minus unexpired reservations; the
// atomic read-check-write paths live in store/credits.rs and this layer
// adds caching, idempotent grants, snapshot maintenance, and retries.
//
// Idempotency is structural: daily rewards collide on a unique
// (user, kind, utc-day) index and plan grants on (user, plan, period), so a
// double claim yields one row no matter how the callers race.

use crate::atoms::constants::{BALANCE_CACHE_TTL_SECS, DAILY_REWARD_CREDITS, KV_BALANCE_PREFIX};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CreditTransaction, MonthlySnapshot, Reservation, TransactionKind};
use crate::engine::cache::KeyValueStore;
use crate::engine::clock::{month_start, utc_day, SharedClock};
use crate::engine::store::Store;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::sync::Arc;

const WRITE_RETRIES: u32 = 3;

pub struct Ledger {
    store: Arc<Store>,
    kv: Arc<dyn KeyValueStore>,
    clock: SharedClock,
}

/// Cross-references carried on a grant row.
#[derive(Debug, Default, Clone)]
pub struct GrantRefs {
    pub related_usage_id: Option<String>,
    pub related_plan_id: Option<String>,
}

impl Ledger {
    pub fn new(store: Arc<Store>, kv: Arc<dyn KeyValueStore>, clock: SharedClock) -> Self {
        Ledger { store, kv, clock }
    }

    fn cache_key(user_id: &str) -> String {
        format!("{KV_BALANCE_PREFIX}{user_id}")
    }

    fn evict(&self, user_id: &str) {
        self.kv.delete(&Self::cache_key(user_id));
    }

    /// SQLite reports lock contention as a busy/locked failure; those are
    /// the only store errors worth retrying.
    fn is_busy(err: &EngineError) -> bool {
        matches!(
            err,
            EngineError::Database(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
        )
    }

    fn with_retries<T>(&self, mut op: impl FnMut() -> EngineResult<T>) -> EngineResult<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if Self::is_busy(&e) && attempt < WRITE_RETRIES => {
                    attempt += 1;
                    let delay = std::time::Duration::from_millis(25 * 2u64.pow(attempt));
                    warn!("[ledger] Store busy, retry {attempt}/{WRITE_RETRIES} after {delay:?}");
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    // ── Reads ──────────────────────────────────────────────────────────

    /// Current balance; cached for 10 s, evicted on any write for the user.
    pub fn balance(&self, user_id: &str) -> EngineResult<i64> {
        let key = Self::cache_key(user_id);
        if let Some(cached) = self.kv.get(&key) {
            if let Ok(v) = cached.parse::<i64>() {
                return Ok(v);
            }
        }
        let balance = self.store.balance_at(user_id, self.clock.now())?;
        self.kv
            .set(&key, &balance.to_string(), Some(BALANCE_CACHE_TTL_SECS));
        Ok(balance)
    }

    pub fn transactions(&self, user_id: &str, limit: i64) -> EngineResult<Vec<CreditTransaction>> {
        self.store.list_transactions(user_id, limit)
    }

    // ── Grants ─────────────────────────────────────────────────────────

    pub fn grant(
        &self,
        user_id: &str,
        kind: TransactionKind,
        amount: i64,
        refs: GrantRefs,
        notes: &str,
    ) -> EngineResult<String> {
        if amount <= 0 {
            return Err(EngineError::Validation("grant amount must be positive".into()));
        }
        let tx = self.transaction_row(user_id, kind, amount, refs, notes);
        let id = tx.id.clone();
        self.with_retries(|| self.store.insert_transaction(&tx, None, None))?;
        self.evict(user_id);
        debug!("[ledger] Granted {amount} to {user_id} ({})", kind.as_str());
        Ok(id)
    }

    /// Daily reward: 50 credits, once per UTC day. Returns the new balance;
    /// a repeat claim within the same day is a Conflict and grants nothing.
    pub fn claim_daily_reward(&self, user_id: &str) -> EngineResult<i64> {
        let now = self.clock.now();
        let day = utc_day(now);
        let tx = self.transaction_row(
            user_id,
            TransactionKind::SystemReward,
            DAILY_REWARD_CREDITS,
            GrantRefs::default(),
            "daily",
        );
        match self.with_retries(|| self.store.insert_transaction(&tx, Some(&day), None)) {
            Ok(()) => {
                self.evict(user_id);
                info!("[ledger] Daily reward granted to {user_id} for {day}");
                self.balance(user_id)
            }
            Err(EngineError::Conflict(_)) => Err(EngineError::Conflict(format!(
                "daily reward already claimed for {day}"
            ))),
            Err(e) => Err(e),
        }
    }

    /// Monthly plan grant, idempotent per (user, plan, billing period start).
    /// Returns false when the period was already granted.
    pub fn grant_plan_credits(
        &self,
        user_id: &str,
        plan_id: &str,
        amount: i64,
        period_start: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let tx = self.transaction_row(
            user_id,
            TransactionKind::GrantPlan,
            amount,
            GrantRefs {
                related_usage_id: None,
                related_plan_id: Some(plan_id.to_string()),
            },
            "monthly plan credits",
        );
        let period = super::store::encode_period(period_start);
        match self.with_retries(|| self.store.insert_transaction(&tx, None, Some(&period))) {
            Ok(()) => {
                self.evict(user_id);
                info!("[ledger] Plan credits granted: {amount} to {user_id} ({plan_id}, {period})");
                Ok(true)
            }
            Err(EngineError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ── Debits ─────────────────────────────────────────────────────────

    /// Debit `amount` iff covered, atomically with the balance read.
    pub fn consume(
        &self,
        user_id: &str,
        amount: i64,
        related_usage_id: Option<&str>,
        notes: &str,
    ) -> EngineResult<String> {
        if amount < 0 {
            return Err(EngineError::Validation("consume amount must be >= 0".into()));
        }
        let tx = self.transaction_row(
            user_id,
            TransactionKind::Consumption,
            -amount,
            GrantRefs {
                related_usage_id: related_usage_id.map(str::to_string),
                related_plan_id: None,
            },
            notes,
        );
        let id = tx.id.clone();
        let now = self.clock.now();
        self.with_retries(|| self.store.consume_atomic(&tx, now))?;
        self.evict(user_id);
        Ok(id)
    }

    // ── Reservations ───────────────────────────────────────────────────

    /// Soft hold used by pre-authorization. Counted against balance reads
    /// until settled, released, or expired (TTL).
    pub fn reserve(&self, user_id: &str, amount: i64, ttl_secs: i64) -> EngineResult<String> {
        if amount < 0 {
            return Err(EngineError::Validation("reserve amount must be >= 0".into()));
        }
        let now = self.clock.now();
        self.store.purge_expired_reservations(now).ok();

        let reservation = Reservation {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            amount,
            expires_at: now + Duration::seconds(ttl_secs),
            created_at: now,
        };
        let id = reservation.id.clone();
        self.with_retries(|| self.store.reserve_atomic(&reservation, now))?;
        self.evict(user_id);
        Ok(id)
    }

    /// Convert the hold into a consumption of `actual` credits. Returns the
    /// amount charged (clamped so the balance never goes negative).
    pub fn settle(
        &self,
        user_id: &str,
        reservation_id: &str,
        actual: i64,
        related_usage_id: Option<&str>,
        notes: &str,
    ) -> EngineResult<i64> {
        let template = self.transaction_row(
            user_id,
            TransactionKind::Consumption,
            0,
            GrantRefs {
                related_usage_id: related_usage_id.map(str::to_string),
                related_plan_id: None,
            },
            notes,
        );
        let now = self.clock.now();
        let charged = self.with_retries(|| {
            self.store
                .settle_reservation_atomic(reservation_id, actual, &template, now)
        })?;
        self.evict(user_id);
        Ok(charged)
    }

    /// Drop the hold without consuming; balance-neutral and idempotent.
    pub fn release(&self, user_id: &str, reservation_id: &str) -> EngineResult<()> {
        self.store.release_reservation(reservation_id)?;
        self.store.purge_expired_reservations(self.clock.now()).ok();
        self.evict(user_id);
        Ok(())
    }

    // ── Snapshots ──────────────────────────────────────────────────────

    /// Idempotent: computes the starting balance from the prior snapshot plus
    /// prior-month deltas and inserts the row if absent. Returns true when a
    /// row was written. Snapshots are an optimization — failure here never
    /// breaks balance reads.
    pub fn snapshot_month(&self, user_id: &str, at: DateTime<Utc>) -> EngineResult<bool> {
        let start = month_start(at);
        let just_before = start - Duration::microseconds(1);

        let prior = self.store.latest_snapshot(user_id, just_before)?;
        let (prior_start, prior_balance) = prior
            .map(|s| (s.month_start, s.starting_balance))
            .unwrap_or((DateTime::<Utc>::MIN_UTC, 0));

        let delta = self
            .store
            .sum_transactions_between(user_id, prior_start, start)?;

        let inserted = self.store.insert_snapshot_if_absent(&MonthlySnapshot {
            user_id: user_id.to_string(),
            month_start: start,
            starting_balance: prior_balance + delta,
        })?;
        if inserted {
            self.evict(user_id);
            debug!(
                "[ledger] Snapshot for {user_id} at {} = {}",
                start,
                prior_balance + delta
            );
        }
        Ok(inserted)
    }

    fn transaction_row(
        &self,
        user_id: &str,
        kind: TransactionKind,
        amount: i64,
        refs: GrantRefs,
        notes: &str,
    ) -> CreditTransaction {
        CreditTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind,
            amount,
            notes: notes.to_string(),
            related_usage_id: refs.related_usage_id,
            related_plan_id: refs.related_plan_id,
            created_at: self.clock.now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cache::MemoryKv;
    use crate::engine::clock::{Clock, ManualClock};
    use chrono::TimeZone;

    fn ledger_at(
        start: DateTime<Utc>,
    ) -> (Ledger, Arc<Store>, Arc<ManualClock>) {
        let clock = ManualClock::at(start);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        (
            Ledger::new(store.clone(), kv, clock.clone()),
            store,
            clock,
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn balance_tracks_grants_and_consumption() {
        let (ledger, _store, _clock) = ledger_at(t0());
        ledger
            .grant("u1", TransactionKind::GrantInitial, 200, GrantRefs::default(), "welcome")
            .unwrap();
        assert_eq!(ledger.balance("u1").unwrap(), 200);

        ledger.consume("u1", 50, None, "chat").unwrap();
        assert_eq!(ledger.balance("u1").unwrap(), 150);
    }

    #[test]
    fn daily_reward_is_idempotent_within_a_day() {
        let (ledger, _store, clock) = ledger_at(t0());
        ledger
            .grant("u1", TransactionKind::GrantInitial, 200, GrantRefs::default(), "")
            .unwrap();

        let new_balance = ledger.claim_daily_reward("u1").unwrap();
        assert_eq!(new_balance, 250);

        let err = ledger.claim_daily_reward("u1").unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert_eq!(ledger.balance("u1").unwrap(), 250);

        // Next UTC day: claimable again.
        clock.advance(Duration::days(1));
        assert_eq!(ledger.claim_daily_reward("u1").unwrap(), 300);
    }

    #[test]
    fn plan_grant_idempotent_per_period() {
        let (ledger, _store, _clock) = ledger_at(t0());
        let period = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        assert!(ledger.grant_plan_credits("u1", "plus", 500, period).unwrap());
        assert!(!ledger.grant_plan_credits("u1", "plus", 500, period).unwrap());
        assert_eq!(ledger.balance("u1").unwrap(), 500);
    }

    #[test]
    fn reserve_settle_matches_consume_and_release_is_neutral() {
        let (ledger, _store, _clock) = ledger_at(t0());
        ledger
            .grant("u1", TransactionKind::GrantInitial, 100, GrantRefs::default(), "")
            .unwrap();

        let r = ledger.reserve("u1", 30, 60).unwrap();
        assert_eq!(ledger.balance("u1").unwrap(), 70);
        assert_eq!(ledger.settle("u1", &r, 30, None, "chat").unwrap(), 30);
        assert_eq!(ledger.balance("u1").unwrap(), 70);

        let r2 = ledger.reserve("u1", 30, 60).unwrap();
        ledger.release("u1", &r2).unwrap();
        assert_eq!(ledger.balance("u1").unwrap(), 70);
    }

    #[test]
    fn reservation_expiry_frees_balance() {
        let (ledger, _store, clock) = ledger_at(t0());
        ledger
            .grant("u1", TransactionKind::GrantInitial, 10, GrantRefs::default(), "")
            .unwrap();

        ledger.reserve("u1", 10, 60).unwrap();
        let err = ledger.reserve("u1", 5, 60).unwrap_err();
        assert_eq!(err.code(), "insufficient_credits");

        clock.advance(Duration::seconds(61));
        assert!(ledger.reserve("u1", 5, 60).is_ok());
    }

    #[test]
    fn snapshot_month_is_idempotent_and_preserves_balance() {
        let (ledger, _store, clock) = ledger_at(t0());
        ledger
            .grant("u1", TransactionKind::GrantInitial, 120, GrantRefs::default(), "")
            .unwrap();
        ledger.consume("u1", 20, None, "chat").unwrap();

        clock.set(Utc.with_ymd_and_hms(2025, 7, 2, 0, 0, 0).unwrap());
        let before = ledger.balance("u1").unwrap();
        assert!(ledger.snapshot_month("u1", clock.now()).unwrap());
        assert!(!ledger.snapshot_month("u1", clock.now()).unwrap());
        assert_eq!(ledger.balance("u1").unwrap(), before);
    }

    #[test]
    fn cache_is_evicted_on_write() {
        let (ledger, _store, _clock) = ledger_at(t0());
        ledger
            .grant("u1", TransactionKind::GrantInitial, 100, GrantRefs::default(), "")
            .unwrap();
        assert_eq!(ledger.balance("u1").unwrap(), 100);
        // A write right after a cached read must be visible immediately.
        ledger.consume("u1", 40, None, "").unwrap();
        assert_eq!(ledger.balance("u1").unwrap(), 60);
    }
}
