//! Shared fixtures for the integration tests: a scripted completion provider
//! and an in-memory file tool.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde_json::{Value, json};

use duet_agent::config::DuetConfig;
use duet_agent::error::{AgentError, Result};
use duet_agent::llm::provider::{Completion, CompletionProvider, EventStream};
use duet_agent::llm::types::{BlockKind, ChatRequest, Message, StreamDelta, StreamEvent, Usage};
use duet_agent::llm::ModelRegistry;
use duet_agent::orchestrator::{Orchestrator, OrchestratorEvent};
use duet_agent::tools::{ToolAdapter, ToolError, ToolRegistry, require_str};
use duet_agent::ToolDefinition;

// ── scripted provider ────────────────────────────────────────────────────────

/// One scripted answer to a streaming call.
pub enum Scripted {
    /// Emit these events, then end.
    Stream(Vec<StreamEvent>),
    /// Emit these events, then go silent forever.
    Hang(Vec<StreamEvent>),
    /// Fail to open the stream with this HTTP status.
    Fail(u16),
}

/// A provider that replays queued answers in order and records every
/// request it receives.
#[derive(Default)]
pub struct ScriptedProvider {
    streams: Mutex<VecDeque<Scripted>>,
    completions: Mutex<VecDeque<std::result::Result<String, u16>>>,
    summary_delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, scripted: Scripted) -> &Self {
        self.streams.lock().unwrap().push_back(scripted);
        self
    }

    /// Queue a plain text reply.
    pub fn text(&self, text: &str) -> &Self {
        self.push(Scripted::Stream(text_events(text)))
    }

    /// Queue a reply that calls one tool.
    pub fn tool_call(&self, id: &str, name: &str, arguments: Value) -> &Self {
        self.push(Scripted::Stream(tool_call_events(id, name, arguments)))
    }

    /// Queue a reply that streams `partial` and then stalls.
    pub fn hang(&self, partial: &str) -> &Self {
        let mut events = text_events(partial);
        events.truncate(events.len() - 3);
        self.push(Scripted::Hang(events))
    }

    pub fn fail(&self, status: u16) -> &Self {
        self.push(Scripted::Fail(status))
    }

    /// Queue an answer for the next non-streaming (summary) call.
    pub fn summary(&self, text: &str) -> &Self {
        self.completions.lock().unwrap().push_back(Ok(text.to_owned()));
        self
    }

    /// Queue a summary answer that arrives only after `delay`.
    pub fn slow_summary(&self, text: &str, delay: Duration) -> &Self {
        *self.summary_delay.lock().unwrap() = Some(delay);
        self.summary(text)
    }

    pub fn summary_failure(&self, status: u16) -> &Self {
        self.completions.lock().unwrap().push_back(Err(status));
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Scripted streaming answers not yet consumed.
    pub fn remaining(&self) -> usize {
        self.streams.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: &ChatRequest) -> Result<EventStream> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.streams.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Stream(events)) => Ok(stream::iter(events.into_iter().map(Ok)).boxed()),
            Some(Scripted::Hang(events)) => Ok(stream::iter(events.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
            Some(Scripted::Fail(status)) => Err(AgentError::ProviderStatus {
                status,
                body: "scripted failure".into(),
            }),
            None => Err(AgentError::Internal("script exhausted".into())),
        }
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion> {
        let delay = self.summary_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.requests.lock().unwrap().push(request.clone());
        let next = self.completions.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(Completion {
                message: Message::agent_text(text),
                usage: Usage::default(),
                stop_reason: Some("end_turn".into()),
            }),
            Some(Err(status)) => Err(AgentError::ProviderStatus {
                status,
                body: "scripted failure".into(),
            }),
            None => Err(AgentError::Internal("no summary scripted".into())),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

// ── event builders ───────────────────────────────────────────────────────────

fn message_start() -> StreamEvent {
    StreamEvent::MessageStart {
        message_id: "msg_scripted".into(),
        model: "scripted-model".into(),
        input_tokens: 12,
    }
}

fn message_end(stop_reason: &str) -> [StreamEvent; 2] {
    [
        StreamEvent::MessageDelta {
            stop_reason: Some(stop_reason.into()),
            usage: Usage {
                input_tokens: 0,
                output_tokens: 7,
            },
        },
        StreamEvent::MessageStop,
    ]
}

/// A text reply streamed word by word.
pub fn text_events(text: &str) -> Vec<StreamEvent> {
    let mut events = vec![
        message_start(),
        StreamEvent::BlockStart {
            index: 0,
            kind: BlockKind::Text,
        },
    ];
    events.extend(text.split_inclusive(' ').map(|chunk| StreamEvent::BlockDelta {
        index: 0,
        delta: StreamDelta::Text(chunk.to_owned()),
    }));
    events.push(StreamEvent::BlockStop { index: 0 });
    events.extend(message_end("end_turn"));
    events
}

/// A reply holding one tool call whose arguments arrive in two fragments.
pub fn tool_call_events(id: &str, name: &str, arguments: Value) -> Vec<StreamEvent> {
    let raw = arguments.to_string();
    let mut mid = raw.len() / 2;
    while !raw.is_char_boundary(mid) {
        mid += 1;
    }
    let (head, tail) = raw.split_at(mid);

    let mut events = vec![
        message_start(),
        StreamEvent::BlockStart {
            index: 0,
            kind: BlockKind::ToolCall {
                id: id.into(),
                name: name.into(),
            },
        },
        StreamEvent::BlockDelta {
            index: 0,
            delta: StreamDelta::ToolArguments(head.to_owned()),
        },
        StreamEvent::BlockDelta {
            index: 0,
            delta: StreamDelta::ToolArguments(tail.to_owned()),
        },
        StreamEvent::BlockStop { index: 0 },
    ];
    events.extend(message_end("tool_use"));
    events
}

// ── mock tools ───────────────────────────────────────────────────────────────

/// `read_file` / `write_file` over an in-memory map.
#[derive(Default)]
pub struct MemoryFs {
    files: Mutex<BTreeMap<String, String>>,
}

impl MemoryFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl ToolAdapter for MemoryFs {
    fn adapter_id(&self) -> &str {
        "memory-fs"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "read_file".into(),
                description: "Read a file".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "path": {"type": "string"} },
                    "required": ["path"]
                }),
            },
            ToolDefinition {
                name: "write_file".into(),
                description: "Write a file".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["path", "content"]
                }),
            },
        ]
    }

    async fn execute(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> std::result::Result<String, ToolError> {
        let path = require_str(&arguments, "path")?;
        match tool_name {
            "write_file" => {
                let content = require_str(&arguments, "content")?;
                self.files
                    .lock()
                    .unwrap()
                    .insert(path.to_owned(), content.to_owned());
                Ok(format!("wrote {} bytes to {path}", content.len()))
            }
            "read_file" => self
                .get(path)
                .ok_or_else(|| ToolError::Failed(format!("{path}: no such file"))),
            other => Err(ToolError::Failed(format!("unsupported tool {other}"))),
        }
    }
}

pub fn registry(fs: &Arc<MemoryFs>) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(fs.clone()).unwrap();
    Arc::new(registry)
}

// ── orchestrator wiring ──────────────────────────────────────────────────────

/// Defaults with fast retries and a fast watchdog.
pub fn fast_config() -> DuetConfig {
    let mut config = DuetConfig::default();
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.limits.watchdog_tick_ms = 20;
    config.director.inactivity_timeout_secs = 1;
    config.actor.inactivity_timeout_secs = 1;
    config
}

pub fn orchestrator(
    provider: &Arc<ScriptedProvider>,
    fs: &Arc<MemoryFs>,
    config: &DuetConfig,
) -> (
    Orchestrator,
    tokio::sync::mpsc::UnboundedReceiver<OrchestratorEvent>,
) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(
        provider.clone(),
        registry(fs),
        ModelRegistry::with_fallbacks(),
        config,
    )
    .unwrap()
    .with_events(tx);
    (orchestrator, rx)
}

pub fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub const SHORT: Duration = Duration::from_millis(200);
