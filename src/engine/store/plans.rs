use super::{opt_ts, parse_ts, ts, Store};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CostUnit, Plan, ServiceCost, UserPlan, UserPlanStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl Store {
    // ── Plans ──────────────────────────────────────────────────────────

    pub fn upsert_plan(&self, plan: &Plan) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO plans (id, name, monthly_credits, price_usd, features_json, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                monthly_credits = excluded.monthly_credits,
                price_usd = excluded.price_usd,
                features_json = excluded.features_json,
                is_active = excluded.is_active",
            params![
                plan.id,
                plan.name,
                plan.monthly_credits,
                plan.price_usd,
                serde_json::to_string(&plan.features)?,
                plan.is_active as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_plan(&self, plan_id: &str) -> EngineResult<Option<Plan>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, monthly_credits, price_usd, features_json, is_active
                 FROM plans WHERE id = ?1",
                params![plan_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, name, monthly_credits, price_usd, features, is_active)| {
            Ok(Plan {
                id,
                name,
                monthly_credits,
                price_usd,
                features: serde_json::from_str(&features)?,
                is_active: is_active != 0,
            })
        })
        .transpose()
    }

    // ── User plans ─────────────────────────────────────────────────────

    pub fn upsert_user_plan(&self, up: &UserPlan) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_plans
                (id, user_id, plan_id, status, start_date, end_date,
                 current_period_start, current_period_end, last_credits_granted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                end_date = excluded.end_date,
                current_period_start = excluded.current_period_start,
                current_period_end = excluded.current_period_end,
                last_credits_granted_at = excluded.last_credits_granted_at",
            params![
                up.id,
                up.user_id,
                up.plan_id,
                up.status.as_str(),
                ts(up.start_date),
                up.end_date.map(ts),
                ts(up.current_period_start),
                ts(up.current_period_end),
                up.last_credits_granted_at.map(ts),
            ],
        )?;
        Ok(())
    }

    /// All ACTIVE plans whose current period ended at or before `now` —
    /// the monthly-grant tick's work list.
    pub fn user_plans_due_for_grant(&self, now: DateTime<Utc>) -> EngineResult<Vec<UserPlan>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, plan_id, status, start_date, end_date,
                    current_period_start, current_period_end, last_credits_granted_at
             FROM user_plans
             WHERE status = 'active' AND current_period_end <= ?1
               AND (end_date IS NULL OR end_date > ?1)
             ORDER BY current_period_end ASC",
        )?;
        let rows = stmt
            .query_map(params![ts(now)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut plans = Vec::with_capacity(rows.len());
        for (id, user_id, plan_id, status, start, end, ps, pe, granted) in rows {
            plans.push(UserPlan {
                status: UserPlanStatus::parse(&status)
                    .ok_or_else(|| EngineError::Internal(format!("bad plan status {status}")))?,
                start_date: parse_ts(&start),
                end_date: opt_ts(end),
                current_period_start: parse_ts(&ps),
                current_period_end: parse_ts(&pe),
                last_credits_granted_at: opt_ts(granted),
                id,
                user_id,
                plan_id,
            });
        }
        Ok(plans)
    }

    // ── Service costs ──────────────────────────────────────────────────

    /// Live read — edits to the table take effect on the next lookup.
    pub fn get_service_cost(&self, service_key: &str) -> EngineResult<Option<ServiceCost>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT service_key, credits_per_unit, unit, notes
                 FROM service_costs WHERE service_key = ?1",
                params![service_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(service_key, credits_per_unit, unit, notes)| {
            Ok(ServiceCost {
                unit: CostUnit::parse(&unit)
                    .ok_or_else(|| EngineError::Internal(format!("bad cost unit {unit}")))?,
                service_key,
                credits_per_unit,
                notes,
            })
        })
        .transpose()
    }

    pub fn upsert_service_cost(&self, cost: &ServiceCost) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO service_costs (service_key, credits_per_unit, unit, notes)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(service_key) DO UPDATE SET
                credits_per_unit = excluded.credits_per_unit,
                unit = excluded.unit,
                notes = excluded.notes",
            params![
                cost.service_key,
                cost.credits_per_unit,
                cost.unit.as_str(),
                cost.notes,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn seeded_costs_are_readable_and_editable() {
        let store = Store::open_in_memory().unwrap();
        let cost = store.get_service_cost("chat.completion").unwrap().unwrap();
        assert_eq!(cost.unit, CostUnit::PerThousandTokens);

        store
            .upsert_service_cost(&ServiceCost {
                service_key: "chat.completion".into(),
                credits_per_unit: 3,
                unit: CostUnit::PerThousandTokens,
                notes: None,
            })
            .unwrap();
        assert_eq!(
            store
                .get_service_cost("chat.completion")
                .unwrap()
                .unwrap()
                .credits_per_unit,
            3
        );
    }

    #[test]
    fn due_plans_scan_respects_period_and_end_date() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        let up = |id: &str, period_end: DateTime<Utc>, end_date: Option<DateTime<Utc>>| UserPlan {
            id: id.into(),
            user_id: format!("user-{id}"),
            plan_id: "plus".into(),
            status: UserPlanStatus::Active,
            start_date: t0 - Duration::days(60),
            end_date,
            current_period_start: period_end - Duration::days(30),
            current_period_end: period_end,
            last_credits_granted_at: None,
        };

        store.upsert_user_plan(&up("due", t0 - Duration::days(1), None)).unwrap();
        store.upsert_user_plan(&up("later", t0 + Duration::days(5), None)).unwrap();
        store
            .upsert_user_plan(&up("ended", t0 - Duration::days(1), Some(t0 - Duration::hours(1))))
            .unwrap();

        let due = store.user_plans_due_for_grant(t0).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "due");
    }
}
