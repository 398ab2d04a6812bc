// ── LLM broker ─────────────────────────────────────────────────────────────
// Adapter over the configured providers. Two call shapes:
//   complete()  — one-shot; internally consumes a stream to completion.
//   stream()    — lazy frame sequence (Chunk / ToolCall / End), pull-based,
//                 not restartable; dropping it cancels the transfer.
// The bounded tool loop feeds tool results back into the model up to
// TOOL_LOOP_MAX_DEPTH rounds before forcing a plain-text answer.

pub mod providers;
pub mod tools;

pub use providers::FrameStream;
pub use tools::{Tool, ToolRegistry, WebSearchTool};

use crate::atoms::constants::TOOL_LOOP_MAX_DEPTH;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    ChatRole, CompletionRequest, CompletionResponse, ProviderConfig, ProviderKind, PromptMessage,
    StreamFrame, TokenUsage, ToolChoice, ToolResult,
};
use async_trait::async_trait;
use log::{debug, warn};
use providers::ProviderClient;
use std::sync::Arc;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, req: CompletionRequest) -> EngineResult<CompletionResponse>;
    async fn stream(&self, req: CompletionRequest) -> EngineResult<FrameStream>;
}

/// Drain a frame stream into a single response. An error frame aborts with
/// that error; text chunks concatenate in arrival order.
pub(crate) async fn collect_stream(mut stream: FrameStream) -> EngineResult<CompletionResponse> {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut usage = None;

    while let Some(frame) = stream.next().await {
        match frame? {
            StreamFrame::Chunk { delta } => text.push_str(&delta),
            StreamFrame::ToolCall { call } => tool_calls.push(call),
            StreamFrame::End {
                usage: end_usage, ..
            } => {
                usage = end_usage;
                break;
            }
        }
    }

    Ok(CompletionResponse {
        text,
        tool_calls,
        usage,
    })
}

pub struct LlmBroker {
    providers: Vec<ProviderConfig>,
}

impl LlmBroker {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        LlmBroker { providers }
    }

    /// Pick the provider for a request: explicit provider id first, then
    /// model-name prefix, then the first configured provider.
    fn resolve(&self, req: &CompletionRequest) -> EngineResult<ProviderClient> {
        if let Some(wanted) = &req.provider {
            if let Some(config) = self.providers.iter().find(|p| &p.id == wanted) {
                return Ok(ProviderClient::new(config));
            }
            return Err(EngineError::Validation(format!(
                "unknown provider '{wanted}'"
            )));
        }

        let by_prefix = if req.model.starts_with("claude") {
            self.providers
                .iter()
                .find(|p| p.kind == ProviderKind::Anthropic)
        } else {
            self.providers.iter().find(|p| p.kind == ProviderKind::OpenAi)
        };

        by_prefix
            .or_else(|| self.providers.first())
            .map(ProviderClient::new)
            .ok_or_else(|| EngineError::Validation("no LLM providers configured".into()))
    }
}

#[async_trait]
impl LlmClient for LlmBroker {
    async fn complete(&self, req: CompletionRequest) -> EngineResult<CompletionResponse> {
        let stream = self.stream(req).await?;
        collect_stream(stream).await
    }

    async fn stream(&self, req: CompletionRequest) -> EngineResult<FrameStream> {
        self.resolve(&req)?.open_stream(&req).await
    }
}

// ── Tool-execution loop ────────────────────────────────────────────────────

/// Run a completion, auto-executing tool calls through the registry and
/// feeding results back, up to a bounded depth. The final round strips the
/// tools so the model must answer in text.
pub async fn run_tool_loop(
    client: &dyn LlmClient,
    registry: &ToolRegistry,
    mut req: CompletionRequest,
) -> EngineResult<(CompletionResponse, TokenUsage)> {
    let mut total_usage = TokenUsage::default();

    for round in 0..=TOOL_LOOP_MAX_DEPTH {
        if round == TOOL_LOOP_MAX_DEPTH {
            // Depth exhausted — force a text answer.
            req.tools.clear();
            req.tool_choice = ToolChoice::None;
        }

        let response = client.complete(req.clone()).await?;
        if let Some(usage) = &response.usage {
            total_usage.merge(usage);
        }

        if response.tool_calls.is_empty() || req.tool_choice == ToolChoice::None {
            return Ok((response, total_usage));
        }

        debug!(
            "[broker] Tool round {round}: executing {} call(s)",
            response.tool_calls.len()
        );

        // Echo the assistant turn, then append one tool message per call.
        req.messages.push(PromptMessage {
            role: ChatRole::Assistant,
            content: response.text.clone(),
            tool_calls: Some(response.tool_calls.clone()),
            tool_call_id: None,
            name: None,
        });

        for call in &response.tool_calls {
            let args: serde_json::Value =
                serde_json::from_str(&call.function.arguments).unwrap_or(serde_json::json!({}));
            let result = match registry.execute(&call.function.name, &args).await {
                Ok(output) => ToolResult {
                    tool_call_id: call.id.clone(),
                    output,
                    success: true,
                },
                Err(e) => {
                    warn!("[broker] Tool '{}' failed: {e}", call.function.name);
                    ToolResult {
                        tool_call_id: call.id.clone(),
                        output: format!("tool error: {e}"),
                        success: false,
                    }
                }
            };
            req.messages.push(PromptMessage {
                role: ChatRole::Tool,
                content: result.output,
                tool_calls: None,
                tool_call_id: Some(result.tool_call_id),
                name: Some(call.function.name.clone()),
            });
        }

        // Requiring a tool once is enough; later rounds decide freely.
        if req.tool_choice == ToolChoice::Required {
            req.tool_choice = ToolChoice::Auto;
        }
    }

    unreachable!("tool loop always returns within the depth bound");
}

/// Scripted client for tests: pops one canned response per call.
pub struct ScriptedLlmClient {
    responses: parking_lot::Mutex<Vec<CompletionResponse>>,
    pub calls: parking_lot::Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlmClient {
    pub fn new(mut responses: Vec<CompletionResponse>) -> Arc<Self> {
        responses.reverse();
        Arc::new(ScriptedLlmClient {
            responses: parking_lot::Mutex::new(responses),
            calls: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, req: CompletionRequest) -> EngineResult<CompletionResponse> {
        self.calls.lock().push(req);
        self.responses
            .lock()
            .pop()
            .ok_or_else(|| EngineError::provider("scripted", "script exhausted", Some(500)))
    }

    async fn stream(&self, req: CompletionRequest) -> EngineResult<FrameStream> {
        let response = self.complete(req).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            // Split the text into a few chunks so consumers exercise
            // incremental delivery.
            for piece in response.text.as_bytes().chunks(8) {
                let delta = String::from_utf8_lossy(piece).to_string();
                if tx.send(Ok(StreamFrame::Chunk { delta })).await.is_err() {
                    return;
                }
            }
            for call in response.tool_calls {
                if tx.send(Ok(StreamFrame::ToolCall { call })).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(Ok(StreamFrame::End {
                    finish_reason: Some("stop".into()),
                    usage: response.usage,
                }))
                .await;
        });
        Ok(FrameStream::from_channel(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{FunctionCall, ToolCall};
    use crate::engine::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            text: text.into(),
            tool_calls: vec![],
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            }),
        }
    }

    fn tool_response(name: &str, args: &str) -> CompletionResponse {
        CompletionResponse {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: "call_1".into(),
                call_type: "function".into(),
                function: FunctionCall {
                    name: name.into(),
                    arguments: args.into(),
                },
            }],
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            }),
        }
    }

    struct UppercaseTool;

    #[async_trait]
    impl Tool for UppercaseTool {
        fn definition(&self) -> crate::atoms::types::ToolDefinition {
            crate::atoms::types::ToolDefinition {
                tool_type: "function".into(),
                function: crate::atoms::types::FunctionDefinition {
                    name: "uppercase".into(),
                    description: "uppercase a string".into(),
                    parameters: json!({"type": "object"}),
                },
            }
        }

        async fn execute(&self, args: &serde_json::Value) -> EngineResult<String> {
            Ok(args["text"].as_str().unwrap_or("").to_uppercase())
        }
    }

    fn registry() -> ToolRegistry {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let mut registry = ToolRegistry::new(clock);
        registry.register(Arc::new(UppercaseTool));
        registry
    }

    fn request_with_tools(registry: &ToolRegistry) -> CompletionRequest {
        let mut req = CompletionRequest::new("gpt-4o-mini", vec![PromptMessage::user("hi")]);
        req.tools = registry.definitions();
        req.tool_choice = ToolChoice::Auto;
        req
    }

    #[tokio::test]
    async fn collect_assembles_chunks_and_usage() {
        let client = ScriptedLlmClient::new(vec![text_response("hello, streamed world")]);
        let stream = client
            .stream(CompletionRequest::new("m", vec![PromptMessage::user("x")]))
            .await
            .unwrap();
        let response = collect_stream(stream).await.unwrap();
        assert_eq!(response.text, "hello, streamed world");
        assert_eq!(response.usage.unwrap().total_tokens, 15);
    }

    #[tokio::test]
    async fn tool_loop_feeds_results_back() {
        let registry = registry();
        let client = ScriptedLlmClient::new(vec![
            tool_response("uppercase", r#"{"text": "quiet"}"#),
            text_response("the shout was QUIET"),
        ]);

        let (response, usage) =
            run_tool_loop(client.as_ref(), &registry, request_with_tools(&registry))
                .await
                .unwrap();
        assert_eq!(response.text, "the shout was QUIET");
        assert_eq!(usage.total_tokens, 30);

        // The second call must carry the tool result message.
        let calls = client.calls.lock();
        assert_eq!(calls.len(), 2);
        let tool_msg = calls[1]
            .messages
            .iter()
            .find(|m| m.role == ChatRole::Tool)
            .expect("tool result appended");
        assert_eq!(tool_msg.content, "QUIET");
    }

    #[tokio::test]
    async fn tool_loop_depth_is_bounded() {
        let registry = registry();
        // Model insists on calling tools forever; the loop must force a
        // final text round instead of spinning.
        let client = ScriptedLlmClient::new(vec![
            tool_response("uppercase", r#"{"text": "a"}"#),
            tool_response("uppercase", r#"{"text": "b"}"#),
            tool_response("uppercase", r#"{"text": "c"}"#),
            text_response("done"),
        ]);

        let (response, _) =
            run_tool_loop(client.as_ref(), &registry, request_with_tools(&registry))
                .await
                .unwrap();
        assert_eq!(response.text, "done");

        // Final round must have stripped the tools.
        let calls = client.calls.lock();
        assert!(calls.last().unwrap().tools.is_empty());
    }

    #[tokio::test]
    async fn failed_tool_reports_error_to_model() {
        let registry = registry();
        let client = ScriptedLlmClient::new(vec![
            tool_response("nonexistent", "{}"),
            text_response("recovered"),
        ]);

        let (response, _) =
            run_tool_loop(client.as_ref(), &registry, request_with_tools(&registry))
                .await
                .unwrap();
        assert_eq!(response.text, "recovered");

        let calls = client.calls.lock();
        let tool_msg = calls[1]
            .messages
            .iter()
            .find(|m| m.role == ChatRole::Tool)
            .unwrap();
        assert!(tool_msg.content.starts_with("tool error:"));
    }
}
