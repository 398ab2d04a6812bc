//! Image-generation job endpoints: enqueue the 4-stage character dataset
//! job (with credit pre-authorization) and the polling fallback for clients
//! without a live socket.

use super::{envelope, ApiResult, AppState, AuthUser};
use crate::atoms::error::EngineError;
use crate::atoms::types::UsageRecord;
use crate::engine::jobs::image_dataset::{ImageDatasetPayload, PromptPair, JOB_TYPE};
use crate::engine::jobs::EnqueueRequest;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct DatasetRequest {
    pub character_id: String,
    pub prompt: PromptPair,
    #[serde(default)]
    pub initial_references: Vec<String>,
    /// Client-chosen progress channel id; defaults to a fresh one.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Age rating of the requested imagery, checked against the user's
    /// preference ceiling.
    #[serde(default)]
    pub content_rating: Option<crate::atoms::types::AgeRating>,
}

pub async fn enqueue_character_dataset(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<DatasetRequest>,
) -> ApiResult {
    if body.character_id.is_empty() {
        return Err(EngineError::Validation("character_id is required".into()).into());
    }
    let user = state.store.require_user(&auth.user_id)?;

    // Pre-auth the full dataset cost; the reservation is released once the
    // job is durably queued (the handler's usage record does the charging).
    let estimate = state.costs.estimate(&UsageRecord {
        id: String::new(),
        user_id: auth.user_id.clone(),
        service_key: "image.character_dataset".into(),
        provider: None,
        model: None,
        input_tokens: None,
        output_tokens: None,
        chars: None,
        units: Some(1.0),
        raw_cost_usd: None,
        credits_charged: None,
        failed_insufficient_credits: false,
        unknown_service: false,
        metadata: serde_json::Value::Null,
        created_at: state.clock.now(),
    })?;
    let grant = state
        .policy
        .authorize(&user, "generate_image", estimate, body.content_rating)?;

    let session_id = body
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut req = EnqueueRequest::new(
        JOB_TYPE,
        serde_json::to_value(ImageDatasetPayload {
            character_id: body.character_id.clone(),
            prompt: body.prompt,
            initial_references: body.initial_references,
        })?,
        auth.user_id.clone(),
    );
    req.session_id = Some(session_id.clone());
    req.dedup_key = Some(format!("{}:{}", auth.user_id, session_id));

    let job = match state.jobs.enqueue(req) {
        Ok(job) => job,
        Err(e) => {
            state.policy.release(&grant).ok();
            return Err(e.into());
        }
    };
    state.policy.release(&grant).ok();

    Ok(envelope(json!({
        "job_id": job.id,
        "session_id": session_id,
        "poll_url": format!("/api/v1/image-generation/job/{}", job.id),
    })))
}

pub async fn poll_job(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(job_id): Path<String>,
) -> ApiResult {
    let job = state
        .jobs
        .get(&job_id)?
        .ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))?;
    if job.owner_user_id != auth.user_id {
        return Err(EngineError::Forbidden("not your job".into()).into());
    }

    Ok(envelope(json!({
        "job_id": job.id,
        "state": job.state,
        "progress": job.progress,
        "result": job.result,
        "error": job.error,
    })))
}
