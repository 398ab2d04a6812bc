// ── Multi-stage character reference dataset ────────────────────────────────
// Four fixed stages (avatar, front, side, back). Each stage renders an
// image conditioned on everything generated so far, uploads it at a
// content-addressed key, and records a dataset row. A re-run after a crash
// observes existing uploads by key and skips straight past them, so the
// final dataset always has exactly four rows and nothing is billed twice.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Job, JobProgress};
use crate::engine::backends::{ImageBackend, ImageRequest, ObjectStore};
use crate::engine::jobs::worker::{JobHandler, Outcome};
use crate::engine::jobs::JobEngine;
use crate::engine::store::{CharacterImage, Store};
use crate::engine::usage::{NewUsage, UsagePipeline};
use crate::engine::clock::SharedClock;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

pub const JOB_TYPE: &str = "image.character_dataset";

/// (storage stage name, i18n message key) in generation order.
const STAGES: [(&str, &str); 4] = [
    ("reference_avatar", "jobs.image_dataset.stage_avatar"),
    ("reference_front", "jobs.image_dataset.stage_front"),
    ("reference_side", "jobs.image_dataset.stage_side"),
    ("reference_back", "jobs.image_dataset.stage_back"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPair {
    pub positive: String,
    pub negative: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDatasetPayload {
    pub character_id: String,
    pub prompt: PromptPair,
    /// Base64-encoded seed images; authoritative when supplied.
    #[serde(default)]
    pub initial_references: Vec<String>,
}

pub struct ImageDatasetHandler {
    object_store: Arc<dyn ObjectStore>,
    image_backend: Arc<dyn ImageBackend>,
    store: Arc<Store>,
    usage: Arc<UsagePipeline>,
    clock: SharedClock,
}

impl ImageDatasetHandler {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        image_backend: Arc<dyn ImageBackend>,
        store: Arc<Store>,
        usage: Arc<UsagePipeline>,
        clock: SharedClock,
    ) -> Self {
        ImageDatasetHandler {
            object_store,
            image_backend,
            store,
            usage,
            clock,
        }
    }

    fn stage_key(character_id: &str, stage: &str) -> String {
        format!("characters/{character_id}/references/{stage}.png")
    }
}

#[async_trait]
impl JobHandler for ImageDatasetHandler {
    fn job_type(&self) -> &'static str {
        JOB_TYPE
    }

    async fn run(&self, job: &Job, engine: &JobEngine) -> EngineResult<Outcome> {
        let payload: ImageDatasetPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| EngineError::Validation(format!("bad dataset payload: {e}")))?;

        let mut references: Vec<Vec<u8>> = Vec::new();
        for (i, seed) in payload.initial_references.iter().enumerate() {
            let bytes = BASE64
                .decode(seed)
                .map_err(|_| EngineError::Validation(format!("initial reference {i} is not base64")))?;
            references.push(bytes);
        }

        let mut paths = Vec::with_capacity(STAGES.len());
        for (index, (stage, message_key)) in STAGES.iter().enumerate() {
            // Stage boundaries are the safe cancellation checkpoints.
            if engine.is_cancel_requested(&job.id)? {
                return Ok(Outcome::Cancelled);
            }

            engine.progress(
                &job.id,
                JobProgress {
                    stage: (index + 1) as i64,
                    total: STAGES.len() as i64,
                    message: message_key.to_string(),
                    data: Some(json!({"percent": index as i64 * 25})),
                },
            )?;

            let key = Self::stage_key(&payload.character_id, stage);
            let bytes = if self.object_store.exists(&key).await? {
                // Prior attempt already uploaded this stage; reuse it.
                debug!("[jobs] {} stage {stage} already uploaded, skipping", job.id);
                self.object_store
                    .get(&key)
                    .await?
                    .ok_or_else(|| EngineError::Transient(format!("object {key} vanished")))?
            } else {
                let rendered = self
                    .image_backend
                    .generate(&ImageRequest {
                        positive_prompt: format!("{}, {stage} view", payload.prompt.positive),
                        negative_prompt: payload.prompt.negative.clone(),
                        references: references.clone(),
                    })
                    .await?;
                self.object_store.put(&key, rendered.clone()).await?;
                rendered
            };

            self.store.record_character_image(&CharacterImage {
                id: uuid::Uuid::new_v4().to_string(),
                character_id: payload.character_id.clone(),
                kind: "reference".into(),
                stage: stage.to_string(),
                path: key.clone(),
                created_at: self.clock.now(),
            })?;

            references.push(bytes);
            paths.push(key);
        }

        engine.progress(
            &job.id,
            JobProgress {
                stage: STAGES.len() as i64,
                total: STAGES.len() as i64,
                message: "jobs.image_dataset.completed".into(),
                data: Some(json!({"percent": 100})),
            },
        )?;

        self.usage.record(NewUsage {
            user_id: job.owner_user_id.clone(),
            service_key: "image.character_dataset".into(),
            units: Some(1.0),
            metadata: json!({"job_id": job.id, "character_id": payload.character_id}),
            ..Default::default()
        })?;

        info!(
            "[jobs] Dataset for character {} complete ({} stages)",
            payload.character_id,
            STAGES.len()
        );
        Ok(Outcome::Success(json!({
            "character_id": payload.character_id,
            "references": paths,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backends::MemoryObjectStore;
    use crate::engine::cache::MemoryKv;
    use crate::engine::clock::ManualClock;
    use crate::engine::jobs::EnqueueRequest;
    use crate::engine::ledger::Ledger;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageBackend for CountingBackend {
        async fn generate(&self, req: &ImageRequest) -> EngineResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("img:{}:{}", req.positive_prompt, req.references.len()).into_bytes())
        }
    }

    struct Fixture {
        engine: Arc<JobEngine>,
        handler: ImageDatasetHandler,
        objects: Arc<MemoryObjectStore>,
        backend: Arc<CountingBackend>,
        store: Arc<Store>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let ledger = Arc::new(Ledger::new(store.clone(), kv, clock.clone()));
        let usage = Arc::new(UsagePipeline::new(store.clone(), ledger, clock.clone()));
        let engine = Arc::new(JobEngine::new(store.clone(), clock.clone()));
        let objects = MemoryObjectStore::new();
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
        });
        let handler = ImageDatasetHandler::new(
            objects.clone(),
            backend.clone(),
            store.clone(),
            usage,
            clock,
        );
        Fixture {
            engine,
            handler,
            objects,
            backend,
            store,
        }
    }

    fn enqueue_and_claim(fixture: &Fixture) -> Job {
        fixture
            .engine
            .enqueue(EnqueueRequest::new(
                JOB_TYPE,
                serde_json::to_value(ImageDatasetPayload {
                    character_id: "ch1".into(),
                    prompt: PromptPair {
                        positive: "knight in silver armor".into(),
                        negative: "blurry".into(),
                    },
                    initial_references: vec![],
                })
                .unwrap(),
                "u1",
            ))
            .unwrap();
        fixture
            .engine
            .claim("w1", &[JOB_TYPE.to_string()])
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn four_stages_four_rows_four_uploads() {
        let fixture = fixture();
        let job = enqueue_and_claim(&fixture);

        let outcome = fixture.handler.run(&job, &fixture.engine).await.unwrap();
        assert!(matches!(outcome, Outcome::Success(_)));

        assert_eq!(fixture.backend.calls.load(Ordering::SeqCst), 4);
        assert_eq!(fixture.objects.len(), 4);
        let rows = fixture.store.list_character_images("ch1", "reference").unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].path, "characters/ch1/references/reference_avatar.png");
    }

    #[tokio::test]
    async fn crash_resume_skips_uploaded_stages() {
        let fixture = fixture();

        // A prior attempt crashed after uploading the first three stages.
        for stage in ["reference_avatar", "reference_front", "reference_side"] {
            fixture
                .objects
                .put(
                    &format!("characters/ch1/references/{stage}.png"),
                    b"old".to_vec(),
                )
                .await
                .unwrap();
        }

        let job = enqueue_and_claim(&fixture);
        fixture.handler.run(&job, &fixture.engine).await.unwrap();

        // Only the missing back view was rendered; dataset has exactly 4 rows.
        assert_eq!(fixture.backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            fixture.store.list_character_images("ch1", "reference").unwrap().len(),
            4
        );
    }

    #[tokio::test]
    async fn cancel_flag_stops_between_stages() {
        let fixture = fixture();
        let job = enqueue_and_claim(&fixture);
        fixture.engine.cancel(&job.id).unwrap();

        let outcome = fixture.handler.run(&job, &fixture.engine).await.unwrap();
        assert!(matches!(outcome, Outcome::Cancelled));
        assert_eq!(fixture.backend.calls.load(Ordering::SeqCst), 0);
    }
}
