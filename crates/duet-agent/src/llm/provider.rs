//! The completion provider boundary.
//!
//! Sessions never talk HTTP directly; they drive a [`CompletionProvider`],
//! which the Anthropic [`super::LlmClient`] implements for production and
//! scripted fakes implement in tests.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::llm::types::{ChatRequest, Message, StreamEvent, Usage};

/// An ordered stream of provider events for one completion call.
pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// A complete, non-streamed completion.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The agent message produced by the call.
    pub message: Message,
    /// Usage counters for the call.
    pub usage: Usage,
    /// Why the model stopped.
    pub stop_reason: Option<String>,
}

/// A streaming completion RPC treated as a black box.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    /// Start a streaming completion and return its event stream.
    ///
    /// Errors returned here (connection refused, non-success status) happen
    /// before any event is produced.  Errors inside the stream are transport
    /// failures mid-response.
    async fn stream(&self, request: &ChatRequest) -> Result<EventStream>;

    /// Run a non-streaming completion.
    async fn complete(&self, request: &ChatRequest) -> Result<Completion>;

    /// List the concrete model identifiers the provider currently serves,
    /// newest first when the provider orders them.
    async fn list_models(&self) -> Result<Vec<String>>;
}
