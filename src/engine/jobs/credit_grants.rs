// ── Monthly plan credit grants ─────────────────────────────────────────────
// A scheduled tick scans ACTIVE user plans whose billing period has rolled
// over and enqueues one grant job per plan, deduplicated per period. The
// handler's ledger write is idempotent on (user, plan, period), so a lease
// expiry mid-run can only ever re-advance the period, never double-grant.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Job, UserPlan};
use crate::engine::clock::SharedClock;
use crate::engine::jobs::worker::{JobHandler, Outcome};
use crate::engine::jobs::{EnqueueRequest, JobEngine};
use crate::engine::ledger::Ledger;
use crate::engine::store::{encode_period, Store};
use async_trait::async_trait;
use chrono::Months;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

pub const JOB_TYPE: &str = "credits.plan_grant";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanGrantPayload {
    pub user_plan: UserPlan,
    pub amount: i64,
}

/// Scan due plans and enqueue grant jobs. Returns how many were enqueued.
pub fn run_grant_tick(
    store: &Store,
    engine: &JobEngine,
    clock: &SharedClock,
) -> EngineResult<usize> {
    let due = store.user_plans_due_for_grant(clock.now())?;
    let mut enqueued = 0;

    for user_plan in due {
        let Some(plan) = store.get_plan(&user_plan.plan_id)? else {
            warn!(
                "[jobs] User plan {} references missing plan {}",
                user_plan.id, user_plan.plan_id
            );
            continue;
        };
        if plan.monthly_credits <= 0 {
            continue;
        }

        let dedup = format!(
            "plan_grant:{}:{}",
            user_plan.id,
            encode_period(user_plan.current_period_start)
        );
        let mut req = EnqueueRequest::new(
            JOB_TYPE,
            serde_json::to_value(PlanGrantPayload {
                amount: plan.monthly_credits,
                user_plan: user_plan.clone(),
            })?,
            user_plan.user_id.clone(),
        );
        req.dedup_key = Some(dedup);
        engine.enqueue(req)?;
        enqueued += 1;
    }

    if enqueued > 0 {
        info!("[jobs] Grant tick enqueued {enqueued} plan grant(s)");
    }
    Ok(enqueued)
}

pub struct PlanGrantHandler {
    ledger: Arc<Ledger>,
    store: Arc<Store>,
    clock: SharedClock,
}

impl PlanGrantHandler {
    pub fn new(ledger: Arc<Ledger>, store: Arc<Store>, clock: SharedClock) -> Self {
        PlanGrantHandler {
            ledger,
            store,
            clock,
        }
    }
}

#[async_trait]
impl JobHandler for PlanGrantHandler {
    fn job_type(&self) -> &'static str {
        JOB_TYPE
    }

    async fn run(&self, job: &Job, _engine: &JobEngine) -> EngineResult<Outcome> {
        let payload: PlanGrantPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| EngineError::Validation(format!("bad grant payload: {e}")))?;
        let user_plan = payload.user_plan;

        let granted = self.ledger.grant_plan_credits(
            &user_plan.user_id,
            &user_plan.plan_id,
            payload.amount,
            user_plan.current_period_start,
        )?;

        // Advance the billing period either way — a false `granted` means a
        // previous attempt already wrote the row before its lease expired.
        let mut advanced = user_plan.clone();
        advanced.current_period_start = user_plan.current_period_end;
        advanced.current_period_end = user_plan
            .current_period_end
            .checked_add_months(Months::new(1))
            .unwrap_or(user_plan.current_period_end);
        advanced.last_credits_granted_at = Some(self.clock.now());
        self.store.upsert_user_plan(&advanced)?;

        Ok(Outcome::Success(json!({
            "granted": granted,
            "amount": payload.amount,
            "next_period_start": advanced.current_period_start.to_rfc3339(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{Plan, UserPlanStatus};
    use crate::engine::cache::MemoryKv;
    use crate::engine::clock::{Clock, ManualClock};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    struct Fixture {
        store: Arc<Store>,
        ledger: Arc<Ledger>,
        engine: Arc<JobEngine>,
        handler: PlanGrantHandler,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let ledger = Arc::new(Ledger::new(store.clone(), kv, clock.clone()));
        let engine = Arc::new(JobEngine::new(store.clone(), clock.clone()));
        let handler = PlanGrantHandler::new(ledger.clone(), store.clone(), clock.clone());
        Fixture {
            store,
            ledger,
            engine,
            handler,
            clock,
        }
    }

    fn seed_plan(fixture: &Fixture, period_end: DateTime<Utc>) -> UserPlan {
        fixture
            .store
            .upsert_plan(&Plan {
                id: "plus".into(),
                name: "Plus".into(),
                monthly_credits: 500,
                price_usd: 9.99,
                features: serde_json::json!({}),
                is_active: true,
            })
            .unwrap();
        let user_plan = UserPlan {
            id: "up1".into(),
            user_id: "u1".into(),
            plan_id: "plus".into(),
            status: UserPlanStatus::Active,
            start_date: period_end - Duration::days(60),
            end_date: None,
            current_period_start: period_end - Duration::days(30),
            current_period_end: period_end,
            last_credits_granted_at: None,
        };
        fixture.store.upsert_user_plan(&user_plan).unwrap();
        user_plan
    }

    #[tokio::test]
    async fn tick_enqueues_once_per_period() {
        let fixture = fixture();
        let clock: SharedClock = fixture.clock.clone();
        seed_plan(&fixture, fixture.clock.now() - Duration::days(1));

        assert_eq!(run_grant_tick(&fixture.store, &fixture.engine, &clock).unwrap(), 1);
        // Second tick dedups against the live job.
        assert_eq!(run_grant_tick(&fixture.store, &fixture.engine, &clock).unwrap(), 1);
        let job = fixture
            .engine
            .claim("w1", &[JOB_TYPE.to_string()])
            .unwrap()
            .unwrap();
        assert!(fixture
            .engine
            .claim("w1", &[JOB_TYPE.to_string()])
            .unwrap()
            .is_none());

        fixture.handler.run(&job, &fixture.engine).await.unwrap();
        assert_eq!(fixture.ledger.balance("u1").unwrap(), 500);
    }

    #[tokio::test]
    async fn rerun_after_lease_expiry_does_not_double_grant() {
        let fixture = fixture();
        let user_plan = seed_plan(&fixture, fixture.clock.now() - Duration::days(1));

        let payload = serde_json::to_value(PlanGrantPayload {
            user_plan,
            amount: 500,
        })
        .unwrap();
        let job = fixture
            .engine
            .enqueue(EnqueueRequest::new(JOB_TYPE, payload, "u1"))
            .unwrap();
        let claimed = fixture
            .engine
            .claim("w1", &[JOB_TYPE.to_string()])
            .unwrap()
            .unwrap();

        // First attempt runs fully but the worker dies before Complete;
        // the lease expires and another worker re-runs the same job.
        fixture.handler.run(&claimed, &fixture.engine).await.unwrap();
        fixture.clock.advance(Duration::seconds(301));
        fixture.engine.reclaim_leases().unwrap();
        let reclaimed = fixture
            .engine
            .claim("w2", &[JOB_TYPE.to_string()])
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, job.id);
        fixture.handler.run(&reclaimed, &fixture.engine).await.unwrap();

        assert_eq!(fixture.ledger.balance("u1").unwrap(), 500);
    }
}
