// ── Engine configuration ───────────────────────────────────────────────────
// TOML file + environment overrides. The file is optional — every field has
// a default that boots a local instance against an on-disk SQLite store.
//
//   CHARHUB_CONFIG      path to the TOML file (default: config dir)
//   CHARHUB_BIND        listen address override
//   CHARHUB_PORT        listen port override
//   CHARHUB_DB          SQLite path override
//   CHARHUB_AUTH_SECRET HS256 signing secret override

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ProviderConfig, ProviderKind};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub database_path: String,
    /// HS256 secret for connect and invite tokens. Auto-generated (and
    /// logged as a warning) when left empty — fine for local runs only.
    #[serde(default)]
    pub auth_secret: String,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default)]
    pub web_search_endpoint: Option<String>,
    /// Number of job workers to start.
    #[serde(default = "default_job_workers")]
    pub job_workers: usize,
    /// Per-action rate limits: requests per minute. Missing actions fall
    /// back to `default_rate_per_minute`.
    #[serde(default)]
    pub rate_limits: std::collections::HashMap<String, u32>,
    #[serde(default = "default_rate_per_minute")]
    pub default_rate_per_minute: u32,
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}
fn default_db_path() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("charhub")
        .join("core.db")
        .to_string_lossy()
        .into_owned()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_job_workers() -> usize {
    2
}
fn default_rate_per_minute() -> u32 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            bind_address: default_bind_address(),
            port: default_port(),
            database_path: default_db_path(),
            auth_secret: String::new(),
            providers: vec![],
            default_model: default_model(),
            web_search_endpoint: None,
            job_workers: default_job_workers(),
            rate_limits: Default::default(),
            default_rate_per_minute: default_rate_per_minute(),
        }
    }
}

impl EngineConfig {
    /// Load the TOML file (if present), then apply environment overrides.
    pub fn load() -> EngineResult<Self> {
        let path = std::env::var("CHARHUB_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("charhub")
                    .join("core.toml")
            });

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            toml::from_str::<EngineConfig>(&raw)
                .map_err(|e| EngineError::Validation(format!("config parse {path:?}: {e}")))?
        } else {
            info!("[config] No config file at {:?} — using defaults", path);
            EngineConfig::default()
        };

        if let Ok(bind) = std::env::var("CHARHUB_BIND") {
            config.bind_address = bind;
        }
        if let Ok(port) = std::env::var("CHARHUB_PORT") {
            config.port = port
                .parse()
                .map_err(|_| EngineError::Validation(format!("bad CHARHUB_PORT: {port}")))?;
        }
        if let Ok(db) = std::env::var("CHARHUB_DB") {
            config.database_path = db;
        }
        if let Ok(secret) = std::env::var("CHARHUB_AUTH_SECRET") {
            config.auth_secret = secret;
        }

        if config.auth_secret.is_empty() {
            config.auth_secret = uuid::Uuid::new_v4().to_string();
            warn!("[config] No auth secret configured — generated an ephemeral one; sessions will not survive restart");
        }

        Ok(config)
    }

    pub fn rate_limit_for(&self, action: &str) -> u32 {
        self.rate_limits
            .get(action)
            .copied()
            .unwrap_or(self.default_rate_per_minute)
    }

    /// Find the provider config for a model name, falling back to the first
    /// configured provider. Prefix match: claude→Anthropic, gpt/o*→OpenAI.
    pub fn provider_for_model(&self, model: &str) -> Option<ProviderConfig> {
        if let Some(p) = self
            .providers
            .iter()
            .find(|p| p.default_model.as_deref() == Some(model))
        {
            return Some(p.clone());
        }
        if model.starts_with("claude") {
            if let Some(p) = self.providers.iter().find(|p| p.kind == ProviderKind::Anthropic) {
                return Some(p.clone());
            }
        }
        if model.starts_with("gpt") || model.starts_with("o1") || model.starts_with("o3") {
            if let Some(p) = self.providers.iter().find(|p| p.kind == ProviderKind::OpenAi) {
                return Some(p.clone());
            }
        }
        self.providers.first().cloned()
    }
}
