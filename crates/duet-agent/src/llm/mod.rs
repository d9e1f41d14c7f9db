//! LLM integration layer.
//!
//! This module provides the interface between the sessions and the
//! completion provider.  It is organized into:
//!
//! - [`types`] -- Core data types (messages, content blocks, streaming events).
//! - [`streaming`] -- SSE line parser for incremental responses.
//! - [`assembler`] -- Reconstructs messages from event streams, with
//!   cancellation and the inactivity watchdog.
//! - [`provider`] -- The [`CompletionProvider`] boundary trait.
//! - [`client`] -- HTTP client for the Anthropic Messages API.
//! - [`models`] -- Model alias resolution.

pub mod assembler;
pub mod client;
pub mod models;
pub mod provider;
pub mod streaming;
pub mod types;

// Re-export the most commonly used types for convenience.
pub use assembler::{
    AssembledMessage, Assembly, Interruption, StreamAssembler, StreamSinks, WatchdogConfig,
    assemble,
};
pub use client::{LlmClient, LlmClientConfig};
pub use models::{ModelFamily, ModelRegistry};
pub use provider::{Completion, CompletionProvider, EventStream};
pub use types::{
    AgentRole, ChatRequest, ContentBlock, Message, Role, StreamEvent, ToolCall, ToolDefinition,
    ToolResult, Usage,
};
