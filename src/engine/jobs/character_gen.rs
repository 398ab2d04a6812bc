// ── Character auto-generation ──────────────────────────────────────────────
// Builds a character profile from a free-form description by asking the
// model for strict JSON, then persists it. Malformed model output is a
// validation failure (no retry — the prompt, not the network, is at fault).

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CompletionRequest, Job, JobProgress, PromptMessage};
use crate::engine::broker::LlmClient;
use crate::engine::clock::SharedClock;
use crate::engine::jobs::worker::{JobHandler, Outcome};
use crate::engine::jobs::JobEngine;
use crate::engine::store::{Character, Store};
use crate::engine::usage::{NewUsage, UsagePipeline};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

pub const JOB_TYPE: &str = "character.autogeneration";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterGenPayload {
    pub description: String,
    #[serde(default)]
    pub name_hint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeneratedProfile {
    name: String,
    persona: String,
}

pub struct CharacterGenHandler {
    llm: Arc<dyn LlmClient>,
    store: Arc<Store>,
    usage: Arc<UsagePipeline>,
    clock: SharedClock,
    model: String,
}

impl CharacterGenHandler {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<Store>,
        usage: Arc<UsagePipeline>,
        clock: SharedClock,
        model: String,
    ) -> Self {
        CharacterGenHandler {
            llm,
            store,
            usage,
            clock,
            model,
        }
    }
}

/// Models wrap JSON in fences more often than not; accept both.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

#[async_trait]
impl JobHandler for CharacterGenHandler {
    fn job_type(&self) -> &'static str {
        JOB_TYPE
    }

    async fn run(&self, job: &Job, engine: &JobEngine) -> EngineResult<Outcome> {
        let payload: CharacterGenPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| EngineError::Validation(format!("bad generation payload: {e}")))?;

        engine.progress(
            &job.id,
            JobProgress {
                stage: 1,
                total: 2,
                message: "jobs.character_gen.drafting".into(),
                data: None,
            },
        )?;

        let name_clause = payload
            .name_hint
            .map(|n| format!(" The character's name is {n}."))
            .unwrap_or_default();
        let mut req = CompletionRequest::new(
            self.model.clone(),
            vec![PromptMessage::user(payload.description)],
        );
        req.system_prompt = Some(format!(
            "You design chat characters. Reply with a single JSON object with \
             exactly two string fields: \"name\" and \"persona\". The persona is \
             a second-person description of how the character speaks and behaves.{name_clause}"
        ));
        let response = self.llm.complete(req).await?;

        let profile: GeneratedProfile = serde_json::from_str(strip_code_fences(&response.text))
            .map_err(|e| {
                EngineError::Validation(format!("model returned unparseable profile: {e}"))
            })?;

        let character = Character {
            id: uuid::Uuid::new_v4().to_string(),
            name: profile.name,
            persona: profile.persona,
            created_at: self.clock.now(),
        };
        self.store.upsert_character(&character)?;

        engine.progress(
            &job.id,
            JobProgress {
                stage: 2,
                total: 2,
                message: "jobs.character_gen.saved".into(),
                data: None,
            },
        )?;

        self.usage.record(NewUsage {
            user_id: job.owner_user_id.clone(),
            service_key: "character.autogeneration".into(),
            units: Some(1.0),
            input_tokens: response.usage.map(|u| u.input_tokens as i64),
            output_tokens: response.usage.map(|u| u.output_tokens as i64),
            metadata: json!({"job_id": job.id}),
            ..Default::default()
        })?;

        Ok(Outcome::Success(json!({
            "character_id": character.id,
            "name": character.name,
        })))
    }
}
