// ── External backends ──────────────────────────────────────────────────────
// The core consumes object storage, image generation, and payments as
// abstract interfaces; the concrete services live outside this repo.
// In-memory implementations back the job handlers in tests and local runs.

use crate::atoms::error::{EngineError, EngineResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

// ── Object storage ─────────────────────────────────────────────────────────

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` at `key`, overwriting. Returns the public path.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> EngineResult<String>;
    async fn exists(&self, key: &str) -> EngineResult<bool>;
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>>;
}

/// Keeps objects in a guarded map. The image-dataset job's crash-resume test
/// leans on `exists()` behaving exactly like a real store.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> EngineResult<String> {
        self.objects.lock().insert(key.to_string(), bytes);
        Ok(key.to_string())
    }

    async fn exists(&self, key: &str) -> EngineResult<bool> {
        Ok(self.objects.lock().contains_key(key))
    }

    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.objects.lock().get(key).cloned())
    }
}

// ── Image generation ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub positive_prompt: String,
    pub negative_prompt: String,
    /// Prior stage outputs (and any uploaded seeds) used as conditioning.
    pub references: Vec<Vec<u8>>,
}

#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate(&self, req: &ImageRequest) -> EngineResult<Vec<u8>>;
}

/// Deterministic fake: output is derived from the prompt and reference count,
/// so tests can assert stage wiring without a diffusion backend.
pub struct StubImageBackend;

#[async_trait]
impl ImageBackend for StubImageBackend {
    async fn generate(&self, req: &ImageRequest) -> EngineResult<Vec<u8>> {
        let mut bytes = format!(
            "png:{}:{}:{}",
            req.positive_prompt,
            req.negative_prompt,
            req.references.len()
        )
        .into_bytes();
        bytes.truncate(256);
        Ok(bytes)
    }
}

// ── Payments ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChargeReceipt {
    pub provider_ref: String,
    pub amount_usd: f64,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Capture a purchase with the external provider; the ledger grant is the
    /// caller's responsibility once this returns.
    async fn capture(&self, user_id: &str, amount_usd: f64) -> EngineResult<ChargeReceipt>;
}

pub struct DisabledPaymentGateway;

#[async_trait]
impl PaymentGateway for DisabledPaymentGateway {
    async fn capture(&self, _user_id: &str, _amount_usd: f64) -> EngineResult<ChargeReceipt> {
        Err(EngineError::Validation(
            "payments are not configured on this deployment".into(),
        ))
    }
}
