// ── HTTP surface ───────────────────────────────────────────────────────────
// axum router for the endpoints the core serves directly: credits, the
// non-streaming message path, invite links, and image-generation jobs.
// Every response uses the `{success, data?, error?}` envelope; error kinds
// map 1:1 onto HTTP status codes here and nowhere else.

mod conversations;
mod credits;
mod jobs;

use crate::atoms::error::{EngineError, ErrorKind};
use crate::atoms::types::{ChatMessage, MessageBody, UserRole};
use crate::engine::auth::TokenSigner;
use crate::engine::clock::SharedClock;
use crate::engine::costs::CostTable;
use crate::engine::hub::SessionHub;
use crate::engine::jobs::JobEngine;
use crate::engine::ledger::Ledger;
use crate::engine::membership::MembershipCore;
use crate::engine::policy::PolicyGate;
use crate::engine::store::Store;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub struct AppState {
    pub store: Arc<Store>,
    pub hub: Arc<SessionHub>,
    pub signer: Arc<TokenSigner>,
    pub ledger: Arc<Ledger>,
    pub policy: Arc<PolicyGate>,
    pub membership: Arc<MembershipCore>,
    pub jobs: Arc<JobEngine>,
    pub costs: CostTable,
    pub clock: SharedClock,
    pub translator: Arc<dyn Translator>,
    pub payments: Arc<dyn crate::engine::backends::PaymentGateway>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/ws", get(ws_upgrade))
        .route(
            "/api/v1/conversations/:id/messages",
            post(conversations::send_message).get(conversations::list_messages),
        )
        .route(
            "/api/v1/conversations/:id/members/generate-invite-link",
            post(conversations::generate_invite_link),
        )
        .route(
            "/api/v1/conversations/:id/members/join-by-token",
            post(conversations::join_by_token),
        )
        .route(
            "/api/v1/image-generation/character-dataset",
            post(jobs::enqueue_character_dataset),
        )
        .route("/api/v1/image-generation/job/:job_id", get(jobs::poll_job))
        .route("/api/v1/credits/balance", get(credits::balance))
        .route("/api/v1/credits/purchase", post(credits::purchase))
        .route("/api/v1/credits/daily-reward", post(credits::daily_reward))
        .route("/api/v1/credits/transactions", get(credits::transactions))
        .route("/api/v1/credits/estimate-cost", post(credits::estimate_cost))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── WebSocket upgrade ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: axum::http::HeaderMap,
    ws: axum::extract::ws::WebSocketUpgrade,
) -> Response {
    let token = query.token.or_else(|| bearer_from_headers(&headers));
    crate::engine::hub::socket::upgrade(state.hub.clone(), state.signer.clone(), ws, token)
}

fn bearer_from_headers(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

// ── Authenticated user extractor ───────────────────────────────────────────

/// Verified bearer identity for HTTP handlers.
pub struct AuthUser {
    pub user_id: String,
    pub role: UserRole,
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_from_headers(&parts.headers)
            .ok_or_else(|| ApiError(EngineError::Auth("missing bearer token".into())))?;
        let claims = state.signer.verify_connect(&token).map_err(ApiError)?;
        Ok(AuthUser {
            user_id: claims.sub,
            role: claims.role,
        })
    }
}

// ── Envelope & error mapping ───────────────────────────────────────────────

pub fn envelope(data: Value) -> Json<Value> {
    Json(json!({"success": true, "data": data}))
}

pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError(EngineError::Serialization(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Internal details stay in the log, not the response.
        let message = match self.0.kind() {
            ErrorKind::Internal => {
                log::error!("[api] Internal error: {}", self.0);
                "internal error".to_string()
            }
            _ => self.0.to_string(),
        };
        let body = json!({
            "success": false,
            "error": {"code": self.0.code(), "message": message},
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult = Result<Json<Value>, ApiError>;

// ── Translator pass ────────────────────────────────────────────────────────
// Response DTOs pass through here before serialization, keyed off the
// requesting user's preferred language. The stored-translation
// implementation swaps message text for a cached translation when one
// exists; the default passes everything through untouched.

pub trait Translator: Send + Sync {
    fn translate_message(&self, message: &mut ChatMessage, lang: &str);
}

pub struct NoopTranslator;

impl Translator for NoopTranslator {
    fn translate_message(&self, _message: &mut ChatMessage, _lang: &str) {}
}

pub struct StoredTranslator {
    store: Arc<Store>,
}

impl StoredTranslator {
    pub fn new(store: Arc<Store>) -> Self {
        StoredTranslator { store }
    }
}

impl Translator for StoredTranslator {
    fn translate_message(&self, message: &mut ChatMessage, lang: &str) {
        if lang.is_empty() || lang == "en" {
            return;
        }
        if let Ok(Some(translated)) = self.store.get_translation(&message.id, lang) {
            message.content = MessageBody::Text(translated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::SenderKind;
    use chrono::Utc;

    #[test]
    fn stored_translator_swaps_content() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .upsert_translation("m1", "pt", "bom dia", Utc::now())
            .unwrap();
        let translator = StoredTranslator::new(store);

        let mut message = ChatMessage {
            id: "m1".into(),
            conversation_id: "c1".into(),
            sender_kind: SenderKind::User,
            sender_ref: "u1".into(),
            content: MessageBody::Text("good morning".into()),
            attachments: vec![],
            metadata: Value::Null,
            created_at: Utc::now(),
        };
        translator.translate_message(&mut message, "pt");
        assert_eq!(message.content.as_text(), "bom dia");

        // English (or unknown) language is a pass-through.
        let mut untouched = message.clone();
        untouched.content = MessageBody::Text("hello".into());
        translator.translate_message(&mut untouched, "en");
        assert_eq!(untouched.content.as_text(), "hello");
    }
}
