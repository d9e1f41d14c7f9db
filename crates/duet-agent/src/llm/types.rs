//! Core types for the Director/Actor protocol.
//!
//! These types model the data flowing between sessions and the completion
//! provider.  They are provider-agnostic at this layer; the [`super::client`]
//! module translates them into the provider wire format.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Which of the two collaborating agents a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// The planning agent: sets strategy and delegates.
    Director,
    /// The execution agent: performs side-effecting work through tools.
    Actor,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Director => write!(f, "director"),
            Self::Actor => write!(f, "actor"),
        }
    }
}

/// The role of a participant within one conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Input to the agent: instructions, relayed replies, tool results.
    User,
    /// Output produced by the agent.
    Agent,
}

// ---------------------------------------------------------------------------
// Content blocks
// ---------------------------------------------------------------------------

/// A tool invocation requested by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier assigned by the provider for correlating results.
    pub id: String,

    /// The name of the tool to invoke.
    pub name: String,

    /// Arguments as a JSON value.  An empty object when the streamed
    /// argument text could not be parsed.
    pub arguments: Value,
}

/// The result of executing a tool, ready to feed back to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The [`ToolCall::id`] this result answers.
    pub call_id: String,

    /// Serialized result content (display-truncated).
    pub content: String,

    /// Whether the invocation failed.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// A failed result carrying a human-readable reason.
    pub fn error(call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: reason.into(),
            is_error: true,
        }
    }
}

/// One typed unit within a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text { text: String },

    /// Model reasoning trace.  Advisory only: never sent back to the
    /// provider as prior reasoning.
    Reasoning { text: String },

    /// A tool invocation.
    ToolCall(ToolCall),

    /// The answer to a tool invocation.
    ToolResult(ToolResult),
}

impl ContentBlock {
    /// Convenience constructor for a text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Approximate size of the block in characters, used by the budgeter.
    pub fn char_len(&self) -> usize {
        match self {
            Self::Text { text } | Self::Reasoning { text } => text.chars().count(),
            Self::ToolCall(call) => {
                call.name.chars().count() + call.arguments.to_string().chars().count()
            }
            Self::ToolResult(result) => result.content.chars().count(),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A single message in a conversation history.
///
/// Messages are immutable once appended to a session: the session only
/// appends, or swaps the whole history during compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// Ordered content blocks.
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// Create a user message with a single text block.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Create an agent message with a single text block.
    pub fn agent_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Create an agent message from assembled blocks.
    pub fn agent(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Agent,
            content,
        }
    }

    /// Create the user-role message that answers a batch of tool calls.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            role: Role::User,
            content: results.into_iter().map(ContentBlock::ToolResult).collect(),
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text of all reasoning blocks.
    pub fn reasoning(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Reasoning { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// All tool calls in block order.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// All tool results in block order.
    pub fn tool_results_iter(&self) -> impl Iterator<Item = &ToolResult> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolResult(result) => Some(result),
            _ => None,
        })
    }

    /// Whether the message requests at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolCall(_)))
    }

    /// Whether this is a user message that carries text, i.e. one that opens
    /// a new round rather than answering tool calls.
    pub fn starts_round(&self) -> bool {
        self.role == Role::User
            && self
                .content
                .iter()
                .any(|b| matches!(b, ContentBlock::Text { .. }))
    }

    /// Copy of the message without tool-call blocks.  Used when an
    /// interrupted turn must be persisted with its partial text only.
    pub fn without_tool_calls(&self) -> Self {
        Self {
            role: self.role,
            content: self
                .content
                .iter()
                .filter(|b| !matches!(b, ContentBlock::ToolCall(_)))
                .cloned()
                .collect(),
        }
    }

    /// Approximate size of the message in characters.
    pub fn char_len(&self) -> usize {
        self.content.iter().map(ContentBlock::char_len).sum()
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A tool definition exposed to the agent so it knows what it may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,

    /// Human-readable description of what the tool does.
    pub description: String,

    /// JSON Schema describing the tool's input parameters.
    pub input_schema: Value,
}

/// A full request to send to the completion provider.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// The concrete model identifier.  Empty means the provider default.
    pub model: String,

    /// System prompt for the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// The conversation history.
    pub messages: Vec<Message>,

    /// Tool definitions the agent may invoke.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Maximum tokens the model may generate in this call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Extended-reasoning token budget, when enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_budget: Option<u32>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

// ---------------------------------------------------------------------------
// Streaming events
// ---------------------------------------------------------------------------

/// The kind of a content block announced by [`StreamEvent::BlockStart`].
#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    /// A text block.
    Text,
    /// A reasoning (thinking) block.
    Reasoning,
    /// A tool invocation block.
    ToolCall { id: String, name: String },
}

/// Incremental delta within a streaming content block.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    /// A chunk of text.
    Text(String),

    /// A chunk of reasoning text.
    Reasoning(String),

    /// An opaque fragment of tool-call argument JSON.
    ToolArguments(String),
}

/// Ordered events emitted by a streaming completion call.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The stream has started.
    MessageStart {
        /// The provider's message id.
        message_id: String,
        /// The model that is responding.
        model: String,
        /// Prompt tokens billed for this request.
        input_tokens: u32,
    },

    /// A new content block has started.
    BlockStart { index: u32, kind: BlockKind },

    /// An incremental delta within a content block.
    BlockDelta { index: u32, delta: StreamDelta },

    /// A content block has finished streaming.
    BlockStop { index: u32 },

    /// Final message metadata.
    MessageDelta {
        /// `"end_turn"`, `"tool_use"`, `"max_tokens"`, ...
        stop_reason: Option<String>,
        /// Usage counters reported with the delta.
        usage: Usage,
    },

    /// The stream has fully terminated.
    MessageStop,

    /// A keepalive event.
    Ping,
}

// ---------------------------------------------------------------------------
// Usage tracking
// ---------------------------------------------------------------------------

/// Token usage information returned by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the input (prompt).
    pub input_tokens: u32,
    /// Number of tokens generated by the model.
    pub output_tokens: u32,
}

impl Usage {
    /// Accumulate another call's usage into this one.
    pub fn add(&mut self, other: Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}
