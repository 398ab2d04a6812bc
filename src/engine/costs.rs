// ── Service costs ──────────────────────────────────────────────────────────
// Config-driven pricing: credits per unit, keyed by service key. The table
// is seeded at migration time and read live from the store, so operator
// edits hot-reload on the next lookup. Rounding is always ceil.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CostUnit, ServiceCost, UsageRecord};
use crate::engine::store::Store;
use std::sync::Arc;

pub struct CostTable {
    store: Arc<Store>,
}

/// Billable quantity in the service's unit dimension.
fn billable_units(record: &UsageRecord, unit: CostUnit) -> f64 {
    match unit {
        CostUnit::PerThousandTokens => {
            let tokens = record.input_tokens.unwrap_or(0) + record.output_tokens.unwrap_or(0);
            tokens as f64 / 1000.0
        }
        CostUnit::PerThousandChars => record.chars.unwrap_or(0) as f64 / 1000.0,
        CostUnit::PerImage
        | CostUnit::PerRequest
        | CostUnit::PerMinute
        | CostUnit::PerStory
        | CostUnit::PerTurn
        | CostUnit::PerCharacter
        | CostUnit::PerPrompt => record.units.unwrap_or(1.0),
    }
}

/// `ceil(units × rate)`, never negative.
pub fn credits_for(record: &UsageRecord, cost: &ServiceCost) -> i64 {
    let units = billable_units(record, cost.unit);
    let credits = (units * cost.credits_per_unit as f64).ceil() as i64;
    credits.max(0)
}

impl CostTable {
    pub fn new(store: Arc<Store>) -> Self {
        CostTable { store }
    }

    pub fn lookup(&self, service_key: &str) -> EngineResult<Option<ServiceCost>> {
        self.store.get_service_cost(service_key)
    }

    /// Price a hypothetical usage; the estimate endpoint and pre-auth path.
    pub fn estimate(&self, record: &UsageRecord) -> EngineResult<i64> {
        let cost = self
            .lookup(&record.service_key)?
            .ok_or_else(|| EngineError::Validation(format!(
                "unknown service key {}",
                record.service_key
            )))?;
        Ok(credits_for(record, &cost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(service: &str) -> UsageRecord {
        UsageRecord {
            id: "u".into(),
            user_id: "u1".into(),
            service_key: service.into(),
            provider: None,
            model: None,
            input_tokens: None,
            output_tokens: None,
            chars: None,
            units: None,
            raw_cost_usd: None,
            credits_charged: None,
            failed_insufficient_credits: false,
            unknown_service: false,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    fn cost(unit: CostUnit, rate: i64) -> ServiceCost {
        ServiceCost {
            service_key: "svc".into(),
            credits_per_unit: rate,
            unit,
            notes: None,
        }
    }

    #[test]
    fn token_pricing_rounds_up() {
        let mut r = record("chat.completion");
        r.input_tokens = Some(900);
        r.output_tokens = Some(350);
        // 1250 tokens at 1 credit per 1k → ceil(1.25) = 2
        assert_eq!(credits_for(&r, &cost(CostUnit::PerThousandTokens, 1)), 2);
    }

    #[test]
    fn exact_thousand_does_not_round_up() {
        let mut r = record("chat.completion");
        r.input_tokens = Some(600);
        r.output_tokens = Some(400);
        assert_eq!(credits_for(&r, &cost(CostUnit::PerThousandTokens, 1)), 1);
    }

    #[test]
    fn per_image_defaults_to_one_unit() {
        let r = record("image.generation");
        assert_eq!(credits_for(&r, &cost(CostUnit::PerImage, 5)), 5);
    }

    #[test]
    fn char_pricing() {
        let mut r = record("tts.synthesis");
        r.chars = Some(2500);
        assert_eq!(credits_for(&r, &cost(CostUnit::PerThousandChars, 1)), 3);
    }

    #[test]
    fn zero_rate_prices_zero() {
        let mut r = record("free.service");
        r.units = Some(3.0);
        assert_eq!(credits_for(&r, &cost(CostUnit::PerRequest, 0)), 0);
    }
}
