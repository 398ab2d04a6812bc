// ── Message translation ────────────────────────────────────────────────────
// Translates a stored message into a target language through the broker and
// caches the result in the translations table, where the response-DTO
// Translator pass picks it up. Idempotent per (message, language).

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CompletionRequest, Job, PromptMessage};
use crate::engine::broker::LlmClient;
use crate::engine::clock::SharedClock;
use crate::engine::jobs::worker::{JobHandler, Outcome};
use crate::engine::jobs::JobEngine;
use crate::engine::store::Store;
use crate::engine::usage::{NewUsage, UsagePipeline};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

pub const JOB_TYPE: &str = "translation.message";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationPayload {
    pub message_id: String,
    pub target_lang: String,
    pub text: String,
}

pub struct TranslationHandler {
    llm: Arc<dyn LlmClient>,
    store: Arc<Store>,
    usage: Arc<UsagePipeline>,
    clock: SharedClock,
    model: String,
}

impl TranslationHandler {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<Store>,
        usage: Arc<UsagePipeline>,
        clock: SharedClock,
        model: String,
    ) -> Self {
        TranslationHandler {
            llm,
            store,
            usage,
            clock,
            model,
        }
    }
}

#[async_trait]
impl JobHandler for TranslationHandler {
    fn job_type(&self) -> &'static str {
        JOB_TYPE
    }

    async fn run(&self, job: &Job, _engine: &JobEngine) -> EngineResult<Outcome> {
        let payload: TranslationPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| EngineError::Validation(format!("bad translation payload: {e}")))?;

        // Already translated (idempotent re-run): nothing to do.
        if self
            .store
            .get_translation(&payload.message_id, &payload.target_lang)?
            .is_some()
        {
            return Ok(Outcome::Success(json!({
                "message_id": payload.message_id,
                "lang": payload.target_lang,
                "cached": true,
            })));
        }

        let mut req = CompletionRequest::new(
            self.model.clone(),
            vec![PromptMessage::user(payload.text.clone())],
        );
        req.system_prompt = Some(format!(
            "Translate the user's message into {}. Reply with only the \
             translation, preserving tone and formatting.",
            payload.target_lang
        ));
        let response = self.llm.complete(req).await?;
        let translated = response.text.trim().to_string();
        if translated.is_empty() {
            return Err(EngineError::Transient("empty translation response".into()));
        }

        self.store.upsert_translation(
            &payload.message_id,
            &payload.target_lang,
            &translated,
            self.clock.now(),
        )?;

        self.usage.record(NewUsage {
            user_id: job.owner_user_id.clone(),
            service_key: "translation.message".into(),
            chars: Some(payload.text.chars().count() as i64),
            metadata: json!({"message_id": payload.message_id, "lang": payload.target_lang}),
            ..Default::default()
        })?;

        Ok(Outcome::Success(json!({
            "message_id": payload.message_id,
            "lang": payload.target_lang,
            "cached": false,
        })))
    }
}
