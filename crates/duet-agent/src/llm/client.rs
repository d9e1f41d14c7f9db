//! Anthropic Messages API client.
//!
//! Implements [`CompletionProvider`] over HTTP with both streaming SSE and
//! non-streaming modes, plus model listing for alias refresh.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::error::{AgentError, Result};
use crate::llm::provider::{Completion, CompletionProvider, EventStream};
use crate::llm::streaming::SseParser;
use crate::llm::types::{
    ChatRequest, ContentBlock, Message, Role, StreamEvent, ToolCall, ToolDefinition, Usage,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default Anthropic API base URL.
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic beta header required for OAuth token authentication.
const ANTHROPIC_OAUTH_BETA: &str = "oauth-2025-04-20";

/// Headroom added above the reasoning budget so the visible answer still has
/// room once thinking is done.
const REASONING_HEADROOM: u32 = 1024;

// ---------------------------------------------------------------------------
// Client configuration
// ---------------------------------------------------------------------------

/// Configuration for connecting to the Anthropic endpoint.
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    /// API key or OAuth token.
    pub api_key: String,
    /// Base URL for the API (e.g. `https://api.anthropic.com`).
    pub base_url: String,
    /// Model used when a request leaves `model` empty.
    pub default_model: String,
    /// Default maximum tokens per response.
    pub max_tokens: u32,
    /// Connect timeout for HTTP requests.  Streams are governed by the
    /// session's inactivity watchdog instead of a total request timeout.
    pub connect_timeout: Duration,
}

impl LlmClientConfig {
    /// Create a configuration for the Anthropic API with default settings.
    pub fn anthropic(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: ANTHROPIC_BASE_URL.to_owned(),
            default_model: model.into(),
            max_tokens: 8192,
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Builder: point the client at a different base URL (proxies, gateways).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for the Anthropic Messages API.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct LlmClient {
    config: Arc<LlmClientConfig>,
    http: reqwest::Client,
}

impl LlmClient {
    /// Create a new client with the given configuration.
    pub fn new(config: LlmClientConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(AgentError::MissingApiKey {
                provider: "anthropic".into(),
            });
        }

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| AgentError::ProviderRequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }

    /// The model used when a request does not name one.
    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    // -- Request building ----------------------------------------------------

    /// Build the JSON body for the Messages API.
    fn build_request_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let model = if request.model.is_empty() {
            self.config.default_model.as_str()
        } else {
            request.model.as_str()
        };
        let mut max_tokens = request.max_tokens.unwrap_or(self.config.max_tokens);

        let mut body = json!({
            "model": model,
            "messages": messages_to_anthropic(&request.messages),
        });

        if let Some(system) = &request.system
            && !system.is_empty()
        {
            body["system"] = json!(system);
        }

        match request.reasoning_budget {
            Some(budget) if budget > 0 => {
                max_tokens = max_tokens.max(budget.saturating_add(REASONING_HEADROOM));
                body["thinking"] = json!({
                    "type": "enabled",
                    "budget_tokens": budget,
                });
            }
            // Temperature is rejected while extended thinking is enabled.
            _ => {
                if let Some(temp) = request.temperature {
                    body["temperature"] = json!(temp);
                }
            }
        }
        body["max_tokens"] = json!(max_tokens);

        if !request.tools.is_empty() {
            body["tools"] = tools_to_anthropic(&request.tools);
        }

        if stream {
            body["stream"] = json!(true);
        }

        body
    }

    /// Authentication and versioning headers.
    ///
    /// Standard API keys use the `x-api-key` header; OAuth tokens (detected
    /// by their `sk-ant-oat` prefix) use `Authorization: Bearer` plus the
    /// OAuth beta header.
    fn headers(&self) -> Result<HeaderMap> {
        let api_key = &self.config.api_key;
        let mut headers = HeaderMap::new();

        if api_key.starts_with("sk-ant-oat") {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|e| {
                    AgentError::ProviderRequestFailed {
                        reason: format!("invalid authorization header: {e}"),
                    }
                })?,
            );
            headers.insert(
                "anthropic-beta",
                HeaderValue::from_static(ANTHROPIC_OAUTH_BETA),
            );
        } else {
            headers.insert(
                "x-api-key",
                HeaderValue::from_str(api_key).map_err(|e| AgentError::ProviderRequestFailed {
                    reason: format!("invalid API key header: {e}"),
                })?,
            );
        }

        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// POST a body to `/v1/messages` and check the status.
    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.config.base_url);

        tracing::debug!(
            url = %url,
            model = %body["model"],
            stream = body["stream"].as_bool().unwrap_or(false),
            "sending completion request"
        );

        let resp = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(body)
            .send()
            .await?;

        check_status(resp).await
    }
}

/// Turn a non-success response into [`AgentError::ProviderStatus`].
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(AgentError::ProviderStatus {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl CompletionProvider for LlmClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(&self, request: &ChatRequest) -> Result<EventStream> {
        let body = self.build_request_body(request, true);
        let resp = self.send(&body).await?;
        Ok(sse_event_stream(resp.bytes_stream()))
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion> {
        let body = self.build_request_body(request, false);
        let resp = self.send(&body).await?;

        let text = resp.text().await?;
        let v: Value =
            serde_json::from_str(&text).map_err(|e| AgentError::ProviderParseFailed {
                reason: format!("invalid JSON response: {e}"),
            })?;

        parse_anthropic_response(&v)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/v1/models?limit=100", self.config.base_url);
        tracing::debug!(url = %url, "listing models");

        let resp = self.http.get(&url).headers(self.headers()?).send().await?;
        let resp = check_status(resp).await?;
        let v: Value = resp.json().await?;

        let models = v["data"]
            .as_array()
            .ok_or_else(|| AgentError::ProviderParseFailed {
                reason: "missing `data` array in model list".into(),
            })?
            .iter()
            .filter_map(|m| m["id"].as_str().map(String::from))
            .collect();

        Ok(models)
    }
}

// ===========================================================================
// SSE byte stream -> event stream
// ===========================================================================

/// Line-buffer a raw SSE byte stream and parse it into [`StreamEvent`]s.
///
/// Lines are split on raw bytes before UTF-8 decoding, so a multi-byte
/// character straddling two network chunks is decoded intact.  The stream
/// ends after the first error.
pub fn sse_event_stream<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        parser: SseParser,
        buffer: Vec<u8>,
        pending: VecDeque<Result<StreamEvent>>,
        exhausted: bool,
    }

    impl<S> State<S> {
        fn push_line(&mut self, raw: &[u8]) {
            let line = match std::str::from_utf8(raw) {
                Ok(line) => line,
                Err(e) => {
                    self.fail(AgentError::ProviderStreamError {
                        reason: format!("invalid UTF-8 in stream: {e}"),
                    });
                    return;
                }
            };
            match self.parser.parse_line(line) {
                Ok(Some(event)) => self.pending.push_back(Ok(event)),
                Ok(None) => {}
                Err(e) => self.fail(e),
            }
        }

        fn drain_lines(&mut self) {
            while !self.exhausted
                && let Some(pos) = self.buffer.iter().position(|&b| b == b'\n')
            {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                self.push_line(&line[..line.len() - 1]);
            }
        }

        fn fail(&mut self, err: AgentError) {
            self.pending.push_back(Err(err));
            self.exhausted = true;
        }
    }

    let state = State {
        bytes: Box::pin(bytes),
        parser: SseParser::new(),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        exhausted: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.exhausted {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(chunk.as_ref());
                    state.drain_lines();
                }
                Some(Err(e)) => state.fail(AgentError::ProviderStreamError {
                    reason: format!("stream read error: {e}"),
                }),
                None => {
                    let rest = std::mem::take(&mut state.buffer);
                    if !rest.is_empty() {
                        state.push_line(&rest);
                    }
                    state.exhausted = true;
                }
            }
        }
    })
    .boxed()
}

// ===========================================================================
// Anthropic format conversion
// ===========================================================================

/// Convert a history to the Anthropic wire format.
///
/// Reasoning blocks are never sent back.  Consecutive messages with the same
/// role are merged into one wire message because the API requires strict
/// user/assistant alternation.
fn messages_to_anthropic(messages: &[Message]) -> Vec<Value> {
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len());
    let mut last_role: Option<Role> = None;

    for msg in messages {
        let blocks: Vec<Value> = msg.content.iter().filter_map(block_to_anthropic).collect();
        if blocks.is_empty() {
            continue;
        }

        if last_role == Some(msg.role)
            && let Some(Value::Array(content)) =
                wire.last_mut().and_then(|m| m.get_mut("content"))
        {
            content.extend(blocks);
            continue;
        }

        let role = match msg.role {
            Role::User => "user",
            Role::Agent => "assistant",
        };
        wire.push(json!({ "role": role, "content": blocks }));
        last_role = Some(msg.role);
    }

    wire
}

fn block_to_anthropic(block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text { text } if text.is_empty() => None,
        ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
        ContentBlock::Reasoning { .. } => None,
        ContentBlock::ToolCall(call) => Some(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.arguments,
        })),
        ContentBlock::ToolResult(result) => Some(json!({
            "type": "tool_result",
            "tool_use_id": result.call_id,
            "content": result.content,
            "is_error": result.is_error,
        })),
    }
}

/// Convert tool definitions into the Anthropic API format.
fn tools_to_anthropic(tools: &[ToolDefinition]) -> Value {
    let tool_values: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            })
        })
        .collect();
    json!(tool_values)
}

/// Parse a non-streaming Messages API response.
fn parse_anthropic_response(v: &Value) -> Result<Completion> {
    let content = v["content"]
        .as_array()
        .ok_or_else(|| AgentError::ProviderParseFailed {
            reason: "missing `content` array in response".into(),
        })?;

    let mut blocks = Vec::with_capacity(content.len());
    for block in content {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(t) = block["text"].as_str() {
                    blocks.push(ContentBlock::text(t));
                }
            }
            Some("thinking") => {
                if let Some(t) = block["thinking"].as_str() {
                    blocks.push(ContentBlock::Reasoning { text: t.to_owned() });
                }
            }
            Some("tool_use") => blocks.push(ContentBlock::ToolCall(ToolCall {
                id: block["id"].as_str().unwrap_or_default().to_owned(),
                name: block["name"].as_str().unwrap_or_default().to_owned(),
                arguments: block["input"].clone(),
            })),
            _ => {}
        }
    }

    let usage = Usage {
        input_tokens: v["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: v["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
    };

    Ok(Completion {
        message: Message::agent(blocks),
        usage,
        stop_reason: v["stop_reason"].as_str().map(String::from),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
