// ── Policy gate ────────────────────────────────────────────────────────────
// Front door for every credit-consuming or rate-limited action. Checks, in
// order: the per-(user, action) token bucket, the content age rating, and —
// when an estimated cost is given — places a 60 s ledger reservation that is
// embedded in the returned grant. Callers settle (actual cost) or release
// (on failure) after the action.

use crate::atoms::constants::{KV_RATE_PREFIX, RESERVATION_TTL_SECS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{AgeRating, User};
use crate::engine::cache::KeyValueStore;
use crate::engine::clock::SharedClock;
use crate::engine::ledger::Ledger;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Proof of authorization; carries the reservation to settle or release.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub user_id: String,
    pub action: String,
    pub reservation_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_ms: i64,
}

pub struct PolicyGate {
    ledger: Arc<Ledger>,
    kv: Arc<dyn KeyValueStore>,
    clock: SharedClock,
    limits: HashMap<String, u32>,
    default_per_minute: u32,
}

impl PolicyGate {
    pub fn new(
        ledger: Arc<Ledger>,
        kv: Arc<dyn KeyValueStore>,
        clock: SharedClock,
        limits: HashMap<String, u32>,
        default_per_minute: u32,
    ) -> Self {
        PolicyGate {
            ledger,
            kv,
            clock,
            limits,
            default_per_minute,
        }
    }

    fn limit_for(&self, action: &str) -> u32 {
        self.limits
            .get(action)
            .copied()
            .unwrap_or(self.default_per_minute)
    }

    /// Take one token from the (user, action) bucket. Burst capacity equals
    /// the per-minute limit; refill is continuous.
    fn take_rate_token(&self, user_id: &str, action: &str) -> EngineResult<()> {
        let limit = self.limit_for(action);
        if limit == 0 {
            return Err(EngineError::RateLimited {
                action: action.to_string(),
            });
        }

        let key = format!("{KV_RATE_PREFIX}{user_id}:{action}");
        let now_ms = self.clock.now().timestamp_millis();
        let capacity = limit as f64;
        let refill_per_ms = capacity / 60_000.0;

        let mut state = self
            .kv
            .get(&key)
            .and_then(|raw| serde_json::from_str::<BucketState>(&raw).ok())
            .unwrap_or(BucketState {
                tokens: capacity,
                last_ms: now_ms,
            });

        let elapsed = (now_ms - state.last_ms).max(0) as f64;
        state.tokens = (state.tokens + elapsed * refill_per_ms).min(capacity);
        state.last_ms = now_ms;

        if state.tokens < 1.0 {
            self.kv
                .set(&key, &serde_json::to_string(&state)?, None);
            return Err(EngineError::RateLimited {
                action: action.to_string(),
            });
        }
        state.tokens -= 1.0;
        self.kv.set(&key, &serde_json::to_string(&state)?, None);
        Ok(())
    }

    /// Authorize `action` for `user`. Denials are typed errors: 429 for the
    /// bucket, 403 for age rating, 402 for credits.
    pub fn authorize(
        &self,
        user: &User,
        action: &str,
        estimated_cost: i64,
        content_rating: Option<AgeRating>,
    ) -> EngineResult<AuthGrant> {
        self.take_rate_token(&user.id, action)?;

        if let Some(rating) = content_rating {
            if rating > user.max_age_rating {
                return Err(EngineError::AgeRestricted(format!(
                    "content rated {} exceeds allowed {}",
                    rating.as_str(),
                    user.max_age_rating.as_str()
                )));
            }
        }

        let reservation_id = if estimated_cost > 0 {
            Some(
                self.ledger
                    .reserve(&user.id, estimated_cost, RESERVATION_TTL_SECS)?,
            )
        } else {
            None
        };

        debug!(
            "[policy] Authorized {action} for {} (cost estimate {estimated_cost})",
            user.id
        );
        Ok(AuthGrant {
            user_id: user.id.clone(),
            action: action.to_string(),
            reservation_id,
        })
    }

    /// Convert the grant's hold into the actual charge. No-op for grants
    /// without a reservation. Returns the credits charged.
    pub fn settle(
        &self,
        grant: &AuthGrant,
        actual_cost: i64,
        related_usage_id: Option<&str>,
    ) -> EngineResult<i64> {
        match &grant.reservation_id {
            Some(reservation_id) => self.ledger.settle(
                &grant.user_id,
                reservation_id,
                actual_cost,
                related_usage_id,
                &grant.action,
            ),
            None => Ok(0),
        }
    }

    /// Drop the hold after a failed action. Idempotent.
    pub fn release(&self, grant: &AuthGrant) -> EngineResult<()> {
        if let Some(reservation_id) = &grant.reservation_id {
            self.ledger.release(&grant.user_id, reservation_id)?;
        }
        Ok(())
    }
}
