// ── Provider adapters ──────────────────────────────────────────────────────
// Direct HTTP calls to AI APIs with SSE streaming. Two wire formats:
// OpenAI-compatible (OpenAI, OpenRouter, custom gateways) and Anthropic.
//
// Transport errors and 429/5xx are retried with exponential backoff, but
// only before the first frame — once streaming starts the sequence is not
// restartable. Dropping the stream cancels the transfer and releases the
// connection.

use crate::atoms::constants::{LLM_INITIAL_RETRY_DELAY_MS, LLM_MAX_RETRIES, LLM_REQUEST_TIMEOUT_SECS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    ChatRole, CompletionRequest, FunctionCall, ProviderConfig, ProviderKind, StreamFrame,
    ToolCall, ToolChoice, TokenUsage,
};
use futures::StreamExt;
use log::{error, info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

/// Check if an HTTP status code should be retried.
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 529)
}

async fn retry_delay(attempt: u32) -> Duration {
    let delay = Duration::from_millis(LLM_INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt));
    tokio::time::sleep(delay).await;
    delay
}

/// Lazy, finite, non-restartable frame sequence. The consumer pulls at its
/// own rate; dropping it aborts the underlying transfer.
pub struct FrameStream {
    rx: mpsc::Receiver<EngineResult<StreamFrame>>,
}

impl FrameStream {
    pub async fn next(&mut self) -> Option<EngineResult<StreamFrame>> {
        self.rx.recv().await
    }

    /// Test constructor: a stream fed from a channel.
    pub fn from_channel(rx: mpsc::Receiver<EngineResult<StreamFrame>>) -> Self {
        FrameStream { rx }
    }

    /// Adapt to a futures `Stream` for combinator-style consumers.
    pub fn into_stream(
        self,
    ) -> tokio_stream::wrappers::ReceiverStream<EngineResult<StreamFrame>> {
        tokio_stream::wrappers::ReceiverStream::new(self.rx)
    }
}

pub(crate) struct ProviderClient {
    client: Client,
    config: ProviderConfig,
}

impl ProviderClient {
    pub fn new(config: &ProviderConfig) -> Self {
        ProviderClient {
            client: Client::new(),
            config: config.clone(),
        }
    }

    fn base_url(&self) -> String {
        self.config
            .base_url
            .clone()
            .unwrap_or_else(|| self.config.kind.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string()
    }

    pub async fn open_stream(&self, req: &CompletionRequest) -> EngineResult<FrameStream> {
        match self.config.kind {
            ProviderKind::Anthropic => self.open_anthropic_stream(req).await,
            _ => self.open_openai_stream(req).await,
        }
    }

    /// POST with retry on transport errors and retryable statuses. Returns
    /// the successful response, ready for SSE reading.
    async fn send_with_retries(
        &self,
        url: &str,
        body: &Value,
        headers: &[(&str, String)],
        timeout_secs: u64,
    ) -> EngineResult<reqwest::Response> {
        let provider = self.config.id.clone();
        let mut last_error = EngineError::provider(&provider, "no attempts made", None);

        for attempt in 0..=LLM_MAX_RETRIES {
            if attempt > 0 {
                let delay = retry_delay(attempt - 1).await;
                warn!(
                    "[broker] {provider} retry {attempt}/{LLM_MAX_RETRIES} after {}ms",
                    delay.as_millis()
                );
            }

            let mut builder = self
                .client
                .post(url)
                .timeout(Duration::from_secs(timeout_secs))
                .header("Content-Type", "application/json");
            for (name, value) in headers {
                builder = builder.header(*name, value);
            }

            let response = match builder.json(body).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = EngineError::provider(&provider, format!("request failed: {e}"), None);
                    continue;
                }
            };

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body_text = response.text().await.unwrap_or_default();
                let detail: String = body_text.chars().take(200).collect();
                error!("[broker] {provider} error {status}: {detail}");
                last_error = EngineError::provider(&provider, detail, Some(status));
                if is_retryable_status(status) {
                    continue;
                }
                return Err(last_error);
            }

            return Ok(response);
        }

        Err(last_error)
    }

    // ── OpenAI-compatible wire format ──────────────────────────────────

    fn format_openai_messages(req: &CompletionRequest) -> Vec<Value> {
        let mut formatted = Vec::with_capacity(req.messages.len() + 1);
        if let Some(system) = &req.system_prompt {
            formatted.push(json!({"role": "system", "content": system}));
        }
        for msg in &req.messages {
            let role = match msg.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::Tool => "tool",
            };
            let mut m = json!({"role": role, "content": msg.content});
            if let Some(tc) = &msg.tool_calls {
                m["tool_calls"] = json!(tc);
            }
            if let Some(id) = &msg.tool_call_id {
                m["tool_call_id"] = json!(id);
            }
            if let Some(name) = &msg.name {
                m["name"] = json!(name);
            }
            formatted.push(m);
        }
        formatted
    }

    async fn open_openai_stream(&self, req: &CompletionRequest) -> EngineResult<FrameStream> {
        let url = format!("{}/chat/completions", self.base_url());

        let mut body = json!({
            "model": req.model,
            "messages": Self::format_openai_messages(req),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !req.tools.is_empty() && req.tool_choice != ToolChoice::None {
            body["tools"] = json!(req.tools);
            body["tool_choice"] = match req.tool_choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::Required => json!("required"),
                ToolChoice::None => json!("none"),
            };
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = json!(max);
        }

        info!("[broker] OpenAI-format request to {} model={}", url, req.model);

        let headers = [(
            "Authorization",
            format!("Bearer {}", self.config.api_key),
        )];
        let response = self
            .send_with_retries(
                &url,
                &body,
                &headers,
                req.timeout_secs.unwrap_or(LLM_REQUEST_TIMEOUT_SECS),
            )
            .await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(read_openai_sse(response, tx));
        Ok(FrameStream { rx })
    }

    // ── Anthropic wire format ──────────────────────────────────────────

    fn format_anthropic_messages(req: &CompletionRequest) -> (Option<String>, Vec<Value>) {
        let mut system = req.system_prompt.clone();
        let mut formatted = Vec::with_capacity(req.messages.len());

        for msg in &req.messages {
            match msg.role {
                ChatRole::System => {
                    // Anthropic takes the system prompt out-of-band.
                    system = Some(msg.content.clone());
                }
                ChatRole::Tool => {
                    if let Some(tc_id) = &msg.tool_call_id {
                        formatted.push(json!({
                            "role": "user",
                            "content": [{
                                "type": "tool_result",
                                "tool_use_id": tc_id,
                                "content": msg.content,
                            }]
                        }));
                    }
                }
                ChatRole::Assistant => {
                    if let Some(tool_calls) = &msg.tool_calls {
                        let mut blocks: Vec<Value> = vec![];
                        if !msg.content.is_empty() {
                            blocks.push(json!({"type": "text", "text": msg.content}));
                        }
                        for tc in tool_calls {
                            let input: Value =
                                serde_json::from_str(&tc.function.arguments).unwrap_or(json!({}));
                            blocks.push(json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": tc.function.name,
                                "input": input,
                            }));
                        }
                        formatted.push(json!({"role": "assistant", "content": blocks}));
                    } else {
                        formatted.push(json!({"role": "assistant", "content": msg.content}));
                    }
                }
                ChatRole::User => {
                    formatted.push(json!({"role": "user", "content": msg.content}));
                }
            }
        }

        (system, formatted)
    }

    fn format_anthropic_tools(req: &CompletionRequest) -> Vec<Value> {
        req.tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.function.name,
                    "description": t.function.description,
                    "input_schema": t.function.parameters,
                })
            })
            .collect()
    }

    async fn open_anthropic_stream(&self, req: &CompletionRequest) -> EngineResult<FrameStream> {
        let url = format!("{}/v1/messages", self.base_url());
        let (system, messages) = Self::format_anthropic_messages(req);

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens.unwrap_or(8192),
            "stream": true,
        });
        if let Some(sys) = system {
            body["system"] = json!(sys);
        }
        if !req.tools.is_empty() && req.tool_choice != ToolChoice::None {
            body["tools"] = json!(Self::format_anthropic_tools(req));
            if req.tool_choice == ToolChoice::Required {
                body["tool_choice"] = json!({"type": "any"});
            }
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = json!(temp);
        }

        info!("[broker] Anthropic request to {} model={}", url, req.model);

        let headers = [
            ("x-api-key", self.config.api_key.clone()),
            ("anthropic-version", "2023-06-01".to_string()),
        ];
        let response = self
            .send_with_retries(
                &url,
                &body,
                &headers,
                req.timeout_secs.unwrap_or(LLM_REQUEST_TIMEOUT_SECS),
            )
            .await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(read_anthropic_sse(response, tx));
        Ok(FrameStream { rx })
    }
}

// ── SSE readers ────────────────────────────────────────────────────────────
// Each reader owns the response body; when the consumer drops the
// FrameStream, the send fails and the reader returns, dropping the transport.

#[derive(Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

fn assemble_tool_calls(partials: Vec<PartialToolCall>) -> Vec<ToolCall> {
    partials
        .into_iter()
        .filter_map(|p| {
            let name = p.name?;
            Some(ToolCall {
                id: p
                    .id
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4())),
                call_type: "function".into(),
                function: FunctionCall {
                    name,
                    arguments: if p.arguments.is_empty() {
                        "{}".into()
                    } else {
                        p.arguments
                    },
                },
            })
        })
        .collect()
}

fn partial_at(partials: &mut Vec<PartialToolCall>, index: usize) -> &mut PartialToolCall {
    while partials.len() <= index {
        partials.push(PartialToolCall::default());
    }
    &mut partials[index]
}

async fn read_openai_sse(
    response: reqwest::Response,
    tx: mpsc::Sender<EngineResult<StreamFrame>>,
) {
    let mut byte_stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut partials: Vec<PartialToolCall> = Vec::new();
    let mut finish_reason: Option<String> = None;
    let mut usage: Option<TokenUsage> = None;

    'outer: while let Some(result) = byte_stream.next().await {
        let bytes = match result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(Err(EngineError::provider(
                        "openai",
                        format!("stream read error: {e}"),
                        None,
                    )))
                    .await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim().to_string();
            buffer = buffer[line_end + 1..].to_string();

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                break 'outer;
            }
            let Ok(v) = serde_json::from_str::<Value>(data) else {
                continue;
            };

            if let Some(u) = v.get("usage") {
                let input = u["prompt_tokens"].as_u64().unwrap_or(0);
                let output = u["completion_tokens"].as_u64().unwrap_or(0);
                if input > 0 || output > 0 {
                    usage = Some(TokenUsage {
                        input_tokens: input,
                        output_tokens: output,
                        total_tokens: u["total_tokens"].as_u64().unwrap_or(input + output),
                    });
                }
            }

            let Some(choice) = v["choices"].get(0) else {
                continue;
            };
            if let Some(reason) = choice["finish_reason"].as_str() {
                finish_reason = Some(reason.to_string());
            }

            let delta = &choice["delta"];
            if let Some(text) = delta["content"].as_str() {
                if !text.is_empty()
                    && tx
                        .send(Ok(StreamFrame::Chunk {
                            delta: text.to_string(),
                        }))
                        .await
                        .is_err()
                {
                    return; // consumer cancelled
                }
            }
            if let Some(tcs) = delta["tool_calls"].as_array() {
                for tc in tcs {
                    let index = tc["index"].as_u64().unwrap_or(0) as usize;
                    let partial = partial_at(&mut partials, index);
                    if let Some(id) = tc["id"].as_str() {
                        partial.id = Some(id.to_string());
                    }
                    if let Some(name) = tc["function"]["name"].as_str() {
                        partial.name = Some(name.to_string());
                    }
                    if let Some(args) = tc["function"]["arguments"].as_str() {
                        partial.arguments.push_str(args);
                    }
                }
            }
        }
    }

    for call in assemble_tool_calls(partials) {
        if tx.send(Ok(StreamFrame::ToolCall { call })).await.is_err() {
            return;
        }
    }
    let _ = tx
        .send(Ok(StreamFrame::End {
            finish_reason,
            usage,
        }))
        .await;
}

async fn read_anthropic_sse(
    response: reqwest::Response,
    tx: mpsc::Sender<EngineResult<StreamFrame>>,
) {
    let mut byte_stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut partials: Vec<PartialToolCall> = Vec::new();
    let mut finish_reason: Option<String> = None;
    let mut usage = TokenUsage::default();
    let mut saw_usage = false;

    'outer: while let Some(result) = byte_stream.next().await {
        let bytes = match result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(Err(EngineError::provider(
                        "anthropic",
                        format!("stream read error: {e}"),
                        None,
                    )))
                    .await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim().to_string();
            buffer = buffer[line_end + 1..].to_string();

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let Ok(v) = serde_json::from_str::<Value>(data) else {
                continue;
            };

            match v["type"].as_str().unwrap_or("") {
                "content_block_delta" => {
                    let delta = &v["delta"];
                    match delta["type"].as_str().unwrap_or("") {
                        "text_delta" => {
                            if let Some(text) = delta["text"].as_str() {
                                if tx
                                    .send(Ok(StreamFrame::Chunk {
                                        delta: text.to_string(),
                                    }))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                        "input_json_delta" => {
                            let index = v["index"].as_u64().unwrap_or(0) as usize;
                            if let Some(partial_json) = delta["partial_json"].as_str() {
                                partial_at(&mut partials, index)
                                    .arguments
                                    .push_str(partial_json);
                            }
                        }
                        _ => {}
                    }
                }
                "content_block_start" => {
                    let block = &v["content_block"];
                    if block["type"].as_str() == Some("tool_use") {
                        let index = v["index"].as_u64().unwrap_or(0) as usize;
                        let partial = partial_at(&mut partials, index);
                        partial.id = block["id"].as_str().map(str::to_string);
                        partial.name = block["name"].as_str().map(str::to_string);
                    }
                }
                "message_start" => {
                    if let Some(input) = v["message"]["usage"]["input_tokens"].as_u64() {
                        usage.input_tokens = input;
                        saw_usage = true;
                    }
                }
                "message_delta" => {
                    if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                        finish_reason = Some(reason.to_string());
                    }
                    if let Some(output) = v["usage"]["output_tokens"].as_u64() {
                        usage.output_tokens = output;
                        saw_usage = true;
                    }
                }
                "message_stop" => break 'outer,
                _ => {}
            }
        }
    }

    for call in assemble_tool_calls(partials) {
        if tx.send(Ok(StreamFrame::ToolCall { call })).await.is_err() {
            return;
        }
    }
    usage.total_tokens = usage.input_tokens + usage.output_tokens;
    let _ = tx
        .send(Ok(StreamFrame::End {
            finish_reason,
            usage: saw_usage.then_some(usage),
        }))
        .await;
}
