//! Conversation endpoints: the non-streaming message path (WS alternative)
//! and invite-link management. AI responses triggered through here stream
//! to whatever sockets are in the room; the HTTP caller gets the persisted
//! user message back.

use super::{envelope, ApiResult, AppState, AuthUser};
use crate::atoms::constants::RECENT_MESSAGES_WINDOW;
use crate::atoms::types::{Attachment, MessageBody};
use crate::engine::hub::ConnCtx;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: MessageBody,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub target_participant_id: Option<String>,
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(conversation_id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> ApiResult {
    // HTTP sends share the socket pipeline; conn id 0 marks "no socket".
    let ctx = ConnCtx {
        conn_id: 0,
        user_id: auth.user_id,
        role: auth.role,
    };
    let message = state
        .hub
        .send_message(
            &ctx,
            &conversation_id,
            body.content,
            body.attachments,
            body.metadata,
            body.target_participant_id,
        )
        .await?;
    Ok(envelope(json!({"message": message})))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    limit: Option<i64>,
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(conversation_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    state
        .membership
        .active_membership(&conversation_id, &auth.user_id)?
        .ok_or_else(|| {
            crate::atoms::error::EngineError::Forbidden(format!(
                "not a member of {conversation_id}"
            ))
        })?;

    let limit = query.limit.unwrap_or(RECENT_MESSAGES_WINDOW).clamp(1, 200);
    let mut messages = state.store.recent_messages(&conversation_id, limit)?;

    // Translator pass: swap in the reader's language before serialization.
    let lang = state
        .store
        .get_user(&auth.user_id)?
        .map(|u| u.preferred_language)
        .unwrap_or_default();
    for message in &mut messages {
        state.translator.translate_message(message, &lang);
    }

    Ok(envelope(json!({"messages": messages})))
}

pub async fn generate_invite_link(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(conversation_id): Path<String>,
) -> ApiResult {
    let token = state
        .membership
        .generate_invite_token(&conversation_id, &auth.user_id)?;
    Ok(envelope(json!({
        "token": token,
        "join_url": format!("/api/v1/conversations/{conversation_id}/members/join-by-token"),
    })))
}

#[derive(Deserialize)]
pub struct JoinByTokenRequest {
    pub token: String,
}

pub async fn join_by_token(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(_conversation_id): Path<String>,
    Json(body): Json<JoinByTokenRequest>,
) -> ApiResult {
    let membership = state
        .membership
        .accept_invite_token(&body.token, &auth.user_id)?;
    Ok(envelope(json!({"membership": membership})))
}
