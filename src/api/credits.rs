//! Credit endpoints: balance, daily reward, transaction history, and cost
//! estimation against the live service-cost table.

use super::{envelope, ApiError, ApiResult, AppState, AuthUser};
use crate::atoms::error::EngineError;
use crate::atoms::types::UsageRecord;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub async fn balance(State(state): State<Arc<AppState>>, auth: AuthUser) -> ApiResult {
    let balance = state.ledger.balance(&auth.user_id)?;
    Ok(envelope(json!({"balance": balance})))
}

/// 50 credits, once per UTC day. A second claim within the same day is a
/// 409 carrying the unchanged balance.
pub async fn daily_reward(State(state): State<Arc<AppState>>, auth: AuthUser) -> ApiResult {
    match state.ledger.claim_daily_reward(&auth.user_id) {
        Ok(new_balance) => Ok(envelope(json!({"new_balance": new_balance}))),
        Err(EngineError::Conflict(message)) => {
            let balance = state.ledger.balance(&auth.user_id)?;
            Err(ApiError(EngineError::Conflict(format!(
                "{message} (balance {balance})"
            ))))
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Deserialize)]
pub struct TransactionsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn transactions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<TransactionsQuery>,
) -> ApiResult {
    let limit = query.limit.clamp(1, 200);
    let transactions = state.ledger.transactions(&auth.user_id, limit)?;
    Ok(envelope(json!({"transactions": transactions})))
}

#[derive(Deserialize)]
pub struct PurchaseRequest {
    pub amount_usd: f64,
    pub credits: i64,
}

/// Capture a purchase with the payment provider, then grant the credits.
/// The gateway call is the authority — a declined capture grants nothing.
pub async fn purchase(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<PurchaseRequest>,
) -> ApiResult {
    if body.credits <= 0 || body.amount_usd <= 0.0 {
        return Err(EngineError::Validation("credits and amount_usd must be positive".into()).into());
    }
    let receipt = state
        .payments
        .capture(&auth.user_id, body.amount_usd)
        .await?;
    state.ledger.grant(
        &auth.user_id,
        crate::atoms::types::TransactionKind::Purchase,
        body.credits,
        crate::engine::ledger::GrantRefs::default(),
        &format!("purchase {}", receipt.provider_ref),
    )?;
    let balance = state.ledger.balance(&auth.user_id)?;
    Ok(envelope(json!({
        "balance": balance,
        "provider_ref": receipt.provider_ref,
    })))
}

#[derive(Deserialize)]
pub struct EstimateRequest {
    pub service_key: String,
    #[serde(default)]
    pub input_tokens: Option<i64>,
    #[serde(default)]
    pub output_tokens: Option<i64>,
    #[serde(default)]
    pub chars: Option<i64>,
    #[serde(default)]
    pub units: Option<f64>,
}

pub async fn estimate_cost(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<EstimateRequest>,
) -> ApiResult {
    let record = UsageRecord {
        id: String::new(),
        user_id: auth.user_id,
        service_key: body.service_key.clone(),
        provider: None,
        model: None,
        input_tokens: body.input_tokens,
        output_tokens: body.output_tokens,
        chars: body.chars,
        units: body.units,
        raw_cost_usd: None,
        credits_charged: None,
        failed_insufficient_credits: false,
        unknown_service: false,
        metadata: serde_json::Value::Null,
        created_at: state.clock.now(),
    };
    let credits = state.costs.estimate(&record)?;
    Ok(envelope(
        json!({"service_key": body.service_key, "estimated_credits": credits}),
    ))
}
