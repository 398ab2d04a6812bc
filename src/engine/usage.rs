// ── Usage pipeline ─────────────────────────────────────────────────────────
// Ingests delivered-service usage and charges the ledger asynchronously.
// `record()` appends an unpriced row and returns immediately; the background
// worker prices records through the cost table and writes `credits_charged`
// exactly once.
//
// Fairness: the store hands out at most one unpriced record per user per
// batch (strict FIFO within a user); records from different users price in
// parallel, bounded by USAGE_MAX_PARALLEL.
//
// Delivered-but-unpayable policy: the service already ran, so an
// insufficient-credits outcome marks the record and charges 0 — never
// retried. Unknown service keys likewise price at 0 with a warning.

use crate::atoms::constants::{USAGE_MAX_PARALLEL, USAGE_POLL_INTERVAL_MS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::UsageRecord;
use crate::engine::clock::SharedClock;
use crate::engine::costs::{credits_for, CostTable};
use crate::engine::ledger::Ledger;
use crate::engine::store::Store;
use log::{debug, error, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a caller reports; the pipeline fills in id, flags, and timestamps.
#[derive(Debug, Clone, Default)]
pub struct NewUsage {
    pub user_id: String,
    pub service_key: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub chars: Option<i64>,
    pub units: Option<f64>,
    pub raw_cost_usd: Option<f64>,
    pub metadata: Value,
}

pub struct UsagePipeline {
    store: Arc<Store>,
    ledger: Arc<Ledger>,
    costs: CostTable,
    clock: SharedClock,
}

impl UsagePipeline {
    pub fn new(store: Arc<Store>, ledger: Arc<Ledger>, clock: SharedClock) -> Self {
        UsagePipeline {
            costs: CostTable::new(store.clone()),
            store,
            ledger,
            clock,
        }
    }

    /// Enqueue a usage record with `credits_charged = NULL`.
    pub fn record(&self, usage: NewUsage) -> EngineResult<String> {
        if usage.user_id.is_empty() || usage.service_key.is_empty() {
            return Err(EngineError::Validation(
                "usage record requires user_id and service_key".into(),
            ));
        }
        let record = UsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: usage.user_id,
            service_key: usage.service_key,
            provider: usage.provider,
            model: usage.model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            chars: usage.chars,
            units: usage.units,
            raw_cost_usd: usage.raw_cost_usd,
            credits_charged: None,
            failed_insufficient_credits: false,
            unknown_service: false,
            metadata: usage.metadata,
            created_at: self.clock.now(),
        };
        let id = record.id.clone();
        self.store.insert_usage_record(&record)?;
        Ok(id)
    }

    /// Price one record. Returns the credits charged.
    fn price_record(&self, record: &UsageRecord) -> EngineResult<i64> {
        let Some(cost) = self.costs.lookup(&record.service_key)? else {
            warn!(
                "[usage] Unknown service key '{}' on record {} — charging 0",
                record.service_key, record.id
            );
            self.store.mark_usage_priced(&record.id, 0, false, true)?;
            return Ok(0);
        };

        let credits = credits_for(record, &cost);
        if credits == 0 {
            self.store.mark_usage_priced(&record.id, 0, false, false)?;
            return Ok(0);
        }

        match self.ledger.consume(
            &record.user_id,
            credits,
            Some(&record.id),
            &record.service_key,
        ) {
            Ok(_) => {
                self.store
                    .mark_usage_priced(&record.id, credits, false, false)?;
                debug!(
                    "[usage] Charged {credits} credits to {} for {} ({})",
                    record.user_id, record.service_key, record.id
                );
                Ok(credits)
            }
            Err(EngineError::InsufficientCredits { .. }) => {
                // Service already delivered; mark and move on, no retry.
                warn!(
                    "[usage] Insufficient credits for {} on {} — recording unpaid",
                    record.user_id, record.id
                );
                self.store.mark_usage_priced(&record.id, 0, true, false)?;
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// One worker pass: price up to `USAGE_MAX_PARALLEL` records (one per
    /// user). Returns how many records were handled.
    pub async fn tick(self: Arc<Self>) -> usize {
        let batch = match self.store.next_unpriced_usage(USAGE_MAX_PARALLEL as i64) {
            Ok(batch) => batch,
            Err(e) => {
                error!("[usage] Failed to fetch unpriced records: {e}");
                return 0;
            }
        };
        if batch.is_empty() {
            return 0;
        }

        let mut handles = Vec::with_capacity(batch.len());
        for record in batch {
            let pipeline = self.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                if let Err(e) = pipeline.price_record(&record) {
                    // Transient (store busy, etc.) — record stays unpriced
                    // and is retried on the next pass.
                    warn!("[usage] Pricing {} failed, will retry: {e}", record.id);
                    false
                } else {
                    true
                }
            }));
        }

        let mut handled = 0;
        for handle in handles {
            if let Ok(true) = handle.await {
                handled += 1;
            }
        }
        handled
    }

    /// Background worker loop. Runs until `stop` is set.
    pub async fn run_worker(self: Arc<Self>, stop: Arc<AtomicBool>) {
        log::info!("[usage] Pricing worker started");
        while !stop.load(Ordering::Relaxed) {
            let handled = self.clone().tick().await;
            if handled == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(USAGE_POLL_INTERVAL_MS)).await;
            }
        }
        log::info!("[usage] Pricing worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::TransactionKind;
    use crate::engine::cache::MemoryKv;
    use crate::engine::clock::ManualClock;
    use crate::engine::ledger::GrantRefs;
    use chrono::{TimeZone, Utc};

    fn pipeline() -> (
        Arc<UsagePipeline>,
        Arc<Ledger>,
        Arc<Store>,
        Arc<ManualClock>,
    ) {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let ledger = Arc::new(Ledger::new(store.clone(), kv, clock.clone()));
        let pipeline = Arc::new(UsagePipeline::new(
            store.clone(),
            ledger.clone(),
            clock.clone(),
        ));
        (pipeline, ledger, store, clock)
    }

    fn chat_usage(user: &str, input: i64, output: i64) -> NewUsage {
        NewUsage {
            user_id: user.into(),
            service_key: "chat.completion".into(),
            provider: Some("openai".into()),
            model: Some("gpt-4o-mini".into()),
            input_tokens: Some(input),
            output_tokens: Some(output),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn records_are_priced_and_charged() {
        let (pipeline, ledger, store, _clock) = pipeline();
        ledger
            .grant("u1", TransactionKind::GrantInitial, 100, GrantRefs::default(), "")
            .unwrap();

        let id = pipeline.record(chat_usage("u1", 900, 350)).unwrap();
        assert_eq!(pipeline.clone().tick().await, 1);

        let record = store.get_usage_record(&id).unwrap().unwrap();
        assert_eq!(record.credits_charged, Some(2));
        assert_eq!(ledger.balance("u1").unwrap(), 98);
    }

    #[tokio::test]
    async fn insufficient_credits_marks_and_charges_zero() {
        let (pipeline, ledger, store, _clock) = pipeline();
        ledger
            .grant("u1", TransactionKind::GrantInitial, 1, GrantRefs::default(), "")
            .unwrap();

        // 5000 tokens → 5 credits, but only 1 available.
        let id = pipeline.record(chat_usage("u1", 4000, 1000)).unwrap();
        pipeline.clone().tick().await;

        let record = store.get_usage_record(&id).unwrap().unwrap();
        assert_eq!(record.credits_charged, Some(0));
        assert!(record.failed_insufficient_credits);
        assert_eq!(ledger.balance("u1").unwrap(), 1);

        // Never retried: a second pass has nothing to do.
        assert_eq!(pipeline.clone().tick().await, 0);
    }

    #[tokio::test]
    async fn unknown_service_marks_and_never_retries() {
        let (pipeline, _ledger, store, _clock) = pipeline();
        let id = pipeline
            .record(NewUsage {
                user_id: "u1".into(),
                service_key: "nonexistent.service".into(),
                ..Default::default()
            })
            .unwrap();
        pipeline.clone().tick().await;

        let record = store.get_usage_record(&id).unwrap().unwrap();
        assert!(record.unknown_service);
        assert_eq!(record.credits_charged, Some(0));
        assert_eq!(pipeline.clone().tick().await, 0);
    }

    #[tokio::test]
    async fn per_user_fifo_ordering() {
        let (pipeline, ledger, store, clock) = pipeline();
        ledger
            .grant("u1", TransactionKind::GrantInitial, 3, GrantRefs::default(), "")
            .unwrap();

        // Two records; first eats the full balance, second must be the one
        // marked unpaid — proving oldest-first processing per user.
        let first = pipeline.record(chat_usage("u1", 2500, 500)).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let second = pipeline.record(chat_usage("u1", 2500, 500)).unwrap();

        pipeline.clone().tick().await;
        pipeline.clone().tick().await;

        let first_rec = store.get_usage_record(&first).unwrap().unwrap();
        let second_rec = store.get_usage_record(&second).unwrap().unwrap();
        assert_eq!(first_rec.credits_charged, Some(3));
        assert!(!first_rec.failed_insufficient_credits);
        assert_eq!(second_rec.credits_charged, Some(0));
        assert!(second_rec.failed_insufficient_credits);
    }
}
