// ── Tool registry ──────────────────────────────────────────────────────────
// Executable capabilities an LLM may invoke mid-generation. One built-in
// tool ships today (web_search); the registry is the extension point.
// Execution is rate-limited by a process-local token bucket and web_search
// responses are cached for an hour by normalized query.

use crate::atoms::constants::{
    KV_WEBSEARCH_PREFIX, TOOL_BUCKET_CAPACITY, TOOL_BUCKET_REFILL_PER_SEC, TOOL_CACHE_TTL_SECS,
    TOOL_EXECUTION_TIMEOUT_SECS,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{FunctionDefinition, ToolDefinition};
use crate::engine::cache::KeyValueStore;
use crate::engine::clock::SharedClock;
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

// ── Token bucket ───────────────────────────────────────────────────────────

struct BucketState {
    tokens: f64,
    last_refill: chrono::DateTime<chrono::Utc>,
}

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    clock: SharedClock,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64, clock: SharedClock) -> Self {
        let now = clock.now();
        TokenBucket {
            capacity,
            refill_per_sec,
            clock,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let elapsed = (now - state.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ── Tool trait ─────────────────────────────────────────────────────────────

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, args: &Value) -> EngineResult<String>;
}

// ── web_search ─────────────────────────────────────────────────────────────

pub struct WebSearchTool {
    client: reqwest::Client,
    endpoint: Option<String>,
    kv: Arc<dyn KeyValueStore>,
}

impl WebSearchTool {
    pub fn new(endpoint: Option<String>, kv: Arc<dyn KeyValueStore>) -> Self {
        WebSearchTool {
            client: reqwest::Client::new(),
            endpoint,
            kv,
        }
    }

    /// Lowercased, whitespace-collapsed query — the cache key.
    fn normalize(query: &str) -> String {
        query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            tool_type: "function".into(),
            function: FunctionDefinition {
                name: "web_search".into(),
                description: "Search the web for current information. \
                              Returns a plain-text digest of the top results."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "The search query"}
                    },
                    "required": ["query"]
                }),
            },
        }
    }

    async fn execute(&self, args: &Value) -> EngineResult<String> {
        let query = args["query"]
            .as_str()
            .ok_or_else(|| EngineError::tool("web_search", "missing query argument"))?;
        let normalized = Self::normalize(query);
        let cache_key = format!("{KV_WEBSEARCH_PREFIX}{normalized}");

        if let Some(cached) = self.kv.get(&cache_key) {
            debug!("[tools] web_search cache hit for '{normalized}'");
            return Ok(cached);
        }

        let Some(endpoint) = &self.endpoint else {
            return Err(EngineError::tool(
                "web_search",
                "no search endpoint configured",
            ));
        };

        let url = format!("{}?q={}", endpoint, urlencoding::encode(&normalized));
        let response = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(TOOL_EXECUTION_TIMEOUT_SECS))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EngineError::tool(
                "web_search",
                format!("search endpoint returned {}", response.status()),
            ));
        }
        let mut body = response.text().await?;
        body.truncate(8192);

        self.kv.set(&cache_key, &body, Some(TOOL_CACHE_TTL_SECS));
        Ok(body)
    }
}

// ── Registry ───────────────────────────────────────────────────────────────

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    bucket: TokenBucket,
}

impl ToolRegistry {
    pub fn new(clock: SharedClock) -> Self {
        ToolRegistry {
            tools: HashMap::new(),
            bucket: TokenBucket::new(TOOL_BUCKET_CAPACITY, TOOL_BUCKET_REFILL_PER_SEC, clock),
        }
    }

    pub fn with_web_search(
        mut self,
        endpoint: Option<String>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Self {
        self.register(Arc::new(WebSearchTool::new(endpoint, kv)));
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().function.name;
        info!("[tools] Registered tool '{name}'");
        self.tools.insert(name, tool);
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Execute a tool by name with a 30 s ceiling and the shared bucket.
    pub async fn execute(&self, name: &str, args: &Value) -> EngineResult<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| EngineError::tool(name, "unknown tool"))?;

        if !self.bucket.try_acquire() {
            return Err(EngineError::RateLimited {
                action: format!("tool:{name}"),
            });
        }

        match tokio::time::timeout(
            std::time::Duration::from_secs(TOOL_EXECUTION_TIMEOUT_SECS),
            tool.execute(args),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::tool(name, "execution timed out")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cache::MemoryKv;
    use crate::engine::clock::ManualClock;
    use chrono::{Duration, TimeZone, Utc};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                tool_type: "function".into(),
                function: FunctionDefinition {
                    name: "echo".into(),
                    description: "echo".into(),
                    parameters: json!({"type": "object"}),
                },
            }
        }

        async fn execute(&self, args: &Value) -> EngineResult<String> {
            Ok(args["text"].as_str().unwrap_or("").to_string())
        }
    }

    #[tokio::test]
    async fn bucket_drains_and_refills() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let mut registry = ToolRegistry::new(clock.clone());
        registry.register(Arc::new(EchoTool));

        // Capacity 10: the 11th call in the same instant is limited.
        for _ in 0..10 {
            assert!(registry.execute("echo", &json!({"text": "hi"})).await.is_ok());
        }
        let err = registry.execute("echo", &json!({})).await.unwrap_err();
        assert_eq!(err.code(), "rate_limited");

        // 1 token per second refill.
        clock.advance(Duration::seconds(2));
        assert!(registry.execute("echo", &json!({})).await.is_ok());
        assert!(registry.execute("echo", &json!({})).await.is_ok());
        assert!(registry.execute("echo", &json!({})).await.is_err());
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let registry = ToolRegistry::new(clock);
        let err = registry.execute("missing", &json!({})).await.unwrap_err();
        assert_eq!(err.code(), "internal_error");
    }

    #[tokio::test]
    async fn web_search_serves_from_cache() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new(clock.clone()));

        // Pre-populate the cache; normalization must collapse whitespace/case.
        kv.set("tool.websearch:rust async book", "cached results", Some(3600));
        let tool = WebSearchTool::new(None, kv);
        let out = tool
            .execute(&json!({"query": "  Rust   ASYNC book "}))
            .await
            .unwrap();
        assert_eq!(out, "cached results");

        // Cache miss without an endpoint is a tool error, not a panic.
        let err = tool.execute(&json!({"query": "other"})).await.unwrap_err();
        assert_eq!(err.code(), "internal_error");
    }
}
