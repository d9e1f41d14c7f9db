//! Director/Actor agent protocol for Duet.
//!
//! Two completion sessions collaborate on one task: a planning agent (the
//! Director) and an executing agent (the Actor).  This crate implements the
//! protocol around them, not the agents themselves.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  directive   ┌───────────┐
//! │ Orchestrator │─────────────>│  Session  │ (Director / Actor)
//! │ (rounds)     │<─────────────│ turn loop │
//! └──────┬───────┘   reply      └─────┬─────┘
//!        │                            │
//!  ┌─────┴──────┐          ┌──────────┴──────────┐
//!  │ Budget +   │          │ Stream    │  Tool   │
//!  │ Compactor  │          │ Assembler │ Dispatch│
//!  └────────────┘          └───────────┴─────────┘
//! ```
//!
//! ## Modules
//!
//! - [`llm`] -- wire types, SSE parsing, stream assembly, the provider trait,
//!   the Anthropic client, and model name resolution.
//! - [`tools`] -- tool adapters, the registry, permissions, and the dispatcher.
//! - [`budget`] -- approximate token estimation and the compaction trigger.
//! - [`compaction`] -- history summarization and round trimming.
//! - [`session`] -- one agent's history and its inner turn loop.
//! - [`directive`] -- classification of Director text.
//! - [`orchestrator`] -- the round-based state machine.
//! - [`transcript`] -- JSON-lines transcripts and history restore.
//! - [`config`] -- run configuration.
//! - [`error`] -- error types.

pub mod budget;
pub mod compaction;
pub mod config;
pub mod directive;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod session;
pub mod tools;
pub mod transcript;

// Re-export the most commonly used types at the crate root.
pub use budget::{ContextBudget, RoleTokens, estimate_tokens};
pub use compaction::{BoundaryMarker, CompactionTrigger, Compactor, CompactorConfig};
pub use config::DuetConfig;
pub use directive::{Directive, DirectiveParser};
pub use error::{AgentError, Result};
pub use llm::{
    AgentRole, ChatRequest, CompletionProvider, ContentBlock, LlmClient, LlmClientConfig, Message,
    ModelRegistry, Role, StreamSinks, ToolCall, ToolDefinition, ToolResult,
};
pub use orchestrator::{
    Orchestrator, OrchestratorEvent, OrchestratorState, PauseHandle, RunOutcome,
};
pub use session::{RetryPolicy, Session, SessionConfig, TurnOutcome, TurnStatus};
pub use tools::{PermissionSet, ToolAdapter, ToolDispatcher, ToolError, ToolRegistry};
pub use transcript::{TranscriptRecord, TranscriptWriter, read_transcript, restore_history};
