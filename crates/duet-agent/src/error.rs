//! Agent error types.
//!
//! All protocol subsystems surface errors through [`AgentError`].  Each
//! variant carries enough context for the orchestrator to decide whether the
//! failure is transient (retry), recoverable within the conversation, or
//! fatal for the session.
//!
//! Tool failures are not represented here: they are rendered into
//! `is_error` tool results by the dispatcher (see
//! [`crate::tools::DispatchError`]) and never abort a turn.

use crate::llm::types::AgentRole;

/// Unified error type for the Duet agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Provider errors -----------------------------------------------------
    /// An HTTP request to the completion provider failed.
    #[error("provider request failed: {reason}")]
    ProviderRequestFailed { reason: String },

    /// The provider answered with a non-success status code.
    #[error("provider returned {status}: {body}")]
    ProviderStatus { status: u16, body: String },

    /// The provider response could not be parsed into the expected format.
    #[error("provider response parse error: {reason}")]
    ProviderParseFailed { reason: String },

    /// The streaming connection was interrupted or produced invalid data.
    #[error("provider stream error: {reason}")]
    ProviderStreamError { reason: String },

    /// The API key is missing for a provider that requires one.
    #[error("missing api key for provider: {provider}")]
    MissingApiKey { provider: String },

    /// A provider call kept failing after every retry was spent.
    #[error("{role} turn failed after {attempts} attempts: {reason}")]
    ProviderRetriesExhausted {
        role: AgentRole,
        attempts: u32,
        reason: String,
    },

    // -- Session errors ------------------------------------------------------
    /// A structural invariant of the conversation history was violated, e.g.
    /// an agent turn would be persisted with an unresolved tool call.
    #[error("history invariant violated in {role} session: {reason}")]
    InvariantViolation { role: AgentRole, reason: String },

    // -- Compaction errors ---------------------------------------------------
    /// The summarization call failed; the history was left untouched.
    #[error("compaction failed: {reason}")]
    CompactionFailed { reason: String },

    /// The summarization call was abandoned on cancellation; the history was
    /// left untouched.
    #[error("compaction cancelled")]
    CompactionCancelled,

    // -- Orchestration errors ------------------------------------------------
    /// The director kept producing text with neither a delegation nor a
    /// completion marker.
    #[error("director output stayed ambiguous after {corrections} corrections")]
    DirectiveAmbiguous { corrections: u32 },

    /// An operation was requested in a state that does not allow it.
    #[error("invalid orchestrator state: {reason}")]
    InvalidState { reason: String },

    /// A runtime permission change was rejected.
    #[error("permission change rejected for `{tool_name}`: {reason}")]
    PermissionChangeRejected { tool_name: String, reason: String },

    // -- Configuration errors ------------------------------------------------
    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    // -- Serialization / IO --------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// File system error (transcripts, config files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Whether the error is a transient provider failure that the retry
    /// policy should absorb.
    ///
    /// Client errors (4xx other than 408/429) are not retried: the same
    /// request would fail the same way.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProviderRequestFailed { .. } | Self::ProviderStreamError { .. } => true,
            Self::ProviderStatus { status, .. } => {
                *status == 408 || *status == 429 || *status == 529 || *status >= 500
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::ProviderRequestFailed {
            reason: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for AgentError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigError {
            reason: format!("invalid TOML: {err}"),
        }
    }
}
