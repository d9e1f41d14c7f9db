//! Tool dispatcher.
//!
//! Turns one [`ToolCall`] into one [`ToolResult`].  Every failure (unknown
//! tool, denied permission, bad arguments, timeout, adapter error) becomes an
//! `is_error` result so the agent can react; nothing here aborts a turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::llm::types::{ToolCall, ToolDefinition, ToolResult};
use crate::tools::{PermissionSet, ToolRegistry};

/// Why a tool call produced an error result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// No registered tool has this name.
    #[error("unknown tool `{tool_name}`")]
    UnknownTool { tool_name: String },

    /// The tool exists but the session may not use it.
    #[error("permission denied: this session may not use `{tool_name}`")]
    PermissionDenied { tool_name: String },

    /// Arguments did not match the tool's schema.
    #[error("invalid arguments for `{tool_name}`: {reason}")]
    InvalidToolArguments { tool_name: String, reason: String },

    /// The tool did not finish within its time limit.
    #[error("`{tool_name}` timed out after {timeout_secs}s")]
    ToolTimeout { tool_name: String, timeout_secs: u64 },

    /// The tool ran and reported a failure.
    #[error("`{tool_name}` failed: {reason}")]
    ToolFailed { tool_name: String, reason: String },
}

impl DispatchError {
    /// Short machine-friendly kind, used in status lines and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTool { .. } => "unknown_tool",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::InvalidToolArguments { .. } => "invalid_arguments",
            Self::ToolTimeout { .. } => "timeout",
            Self::ToolFailed { .. } => "failed",
        }
    }
}

/// Timeouts and output limits.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Timeout for tools without an explicit entry.
    pub default_timeout: Duration,
    /// Per-tool timeout overrides.
    pub timeouts: HashMap<String, Duration>,
    /// Maximum characters of tool output placed in the conversation.
    pub display_limit: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            timeouts: HashMap::new(),
            display_limit: 16_000,
        }
    }
}

impl DispatcherConfig {
    /// The timeout that applies to a tool.
    pub fn timeout_for(&self, tool_name: &str) -> Duration {
        self.timeouts
            .get(tool_name)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

/// Everything the dispatcher knows about one executed call.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// The result to append to the conversation (display-truncated).
    pub result: ToolResult,
    /// The untruncated output, for transcripts.
    pub full_content: String,
    /// Whether `result.content` was shortened.
    pub truncated: bool,
    /// Set when the result is an error.
    pub error: Option<DispatchError>,
    /// Wall-clock time spent, including validation.
    pub elapsed: Duration,
}

impl DispatchOutcome {
    fn failure(call: &ToolCall, error: DispatchError, started: Instant) -> Self {
        let content = format!("Error: {error}");
        Self {
            result: ToolResult::error(&call.id, content.clone()),
            full_content: content,
            truncated: false,
            error: Some(error),
            elapsed: started.elapsed(),
        }
    }
}

/// Executes tool calls against a shared registry.
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    config: DispatcherConfig,
}

impl ToolDispatcher {
    /// Create a dispatcher.
    pub fn new(registry: Arc<ToolRegistry>, config: DispatcherConfig) -> Self {
        Self { registry, config }
    }

    /// The shared registry.
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Definitions of the tools a permission set allows, in name order.
    pub fn definitions_for(&self, permissions: &PermissionSet) -> Vec<ToolDefinition> {
        permissions
            .allowed()
            .filter_map(|name| self.registry.definition(name).cloned())
            .collect()
    }

    /// Execute one call under a session's permissions.
    pub async fn execute(&self, permissions: &PermissionSet, call: &ToolCall) -> DispatchOutcome {
        let started = Instant::now();

        let Some(tool) = self.registry.get(&call.name) else {
            return self.reject(
                call,
                DispatchError::UnknownTool {
                    tool_name: call.name.clone(),
                },
                started,
            );
        };

        if !permissions.allows(&call.name) {
            return self.reject(
                call,
                DispatchError::PermissionDenied {
                    tool_name: call.name.clone(),
                },
                started,
            );
        }

        if let Err(errors) = tool.schema.validate(&call.arguments) {
            let reason = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{path}: {e}")
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");
            return self.reject(
                call,
                DispatchError::InvalidToolArguments {
                    tool_name: call.name.clone(),
                    reason,
                },
                started,
            );
        }

        let timeout = self.config.timeout_for(&call.name);
        debug!(tool = %call.name, call_id = %call.id, timeout_ms = timeout.as_millis() as u64, "executing tool");

        let run = tool.adapter.execute(&call.name, call.arguments.clone());
        let output = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return self.reject(
                    call,
                    DispatchError::ToolFailed {
                        tool_name: call.name.clone(),
                        reason: e.to_string(),
                    },
                    started,
                );
            }
            Err(_) => {
                return self.reject(
                    call,
                    DispatchError::ToolTimeout {
                        tool_name: call.name.clone(),
                        timeout_secs: timeout.as_secs().max(1),
                    },
                    started,
                );
            }
        };

        let (content, truncated) = truncate_for_display(&output, self.config.display_limit);
        let elapsed = started.elapsed();
        debug!(
            tool = %call.name,
            call_id = %call.id,
            elapsed_ms = elapsed.as_millis() as u64,
            truncated,
            "tool completed"
        );

        DispatchOutcome {
            result: ToolResult {
                call_id: call.id.clone(),
                content,
                is_error: false,
            },
            full_content: output,
            truncated,
            error: None,
            elapsed,
        }
    }

    fn reject(&self, call: &ToolCall, error: DispatchError, started: Instant) -> DispatchOutcome {
        warn!(tool = %call.name, call_id = %call.id, kind = error.kind(), error = %error, "tool call failed");
        DispatchOutcome::failure(call, error, started)
    }
}

/// Truncate `raw` to at most `limit` characters, appending a notice.
pub fn truncate_for_display(raw: &str, limit: usize) -> (String, bool) {
    let Some((end, _)) = raw.char_indices().nth(limit) else {
        return (raw.to_owned(), false);
    };
    let total_chars = raw.chars().count();
    let mut shown = raw[..end].to_owned();
    shown.push_str(&format!(
        "\n\n[... output truncated at {limit} chars ({total_chars} total)]"
    ));
    (shown, true)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tools::test_support::registry;

    fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            name: name.into(),
            arguments,
        }
    }

    fn dispatcher(delay: Duration, config: DispatcherConfig) -> ToolDispatcher {
        ToolDispatcher::new(Arc::new(registry(delay)), config)
    }

    fn all_allowed() -> PermissionSet {
        PermissionSet::from_allow_list(["*"], ["echo", "fail"])
    }

    #[tokio::test]
    async fn successful_call_returns_output() {
        let d = dispatcher(Duration::ZERO, DispatcherConfig::default());
        let outcome = d
            .execute(&all_allowed(), &call("echo", json!({"text": "hi"})))
            .await;

        assert!(!outcome.result.is_error);
        assert_eq!(outcome.result.call_id, "call_1");
        assert_eq!(outcome.result.content, "hi");
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn unknown_tool_is_error_result() {
        let d = dispatcher(Duration::ZERO, DispatcherConfig::default());
        let outcome = d.execute(&all_allowed(), &call("nope", json!({}))).await;

        assert!(outcome.result.is_error);
        assert!(matches!(
            outcome.error,
            Some(DispatchError::UnknownTool { .. })
        ));
    }

    #[tokio::test]
    async fn revoked_tool_is_permission_denied() {
        let d = dispatcher(Duration::ZERO, DispatcherConfig::default());
        let perms = all_allowed().revoke("echo");
        let outcome = d.execute(&perms, &call("echo", json!({"text": "hi"}))).await;

        assert!(outcome.result.is_error);
        assert!(outcome.result.content.contains("permission denied"));
        assert_eq!(outcome.error.unwrap().kind(), "permission_denied");
    }

    #[tokio::test]
    async fn missing_required_field_names_the_field() {
        let d = dispatcher(Duration::ZERO, DispatcherConfig::default());
        let outcome = d.execute(&all_allowed(), &call("echo", json!({}))).await;

        assert!(outcome.result.is_error);
        assert!(
            outcome.result.content.contains("text"),
            "content was {}",
            outcome.result.content
        );
        assert!(matches!(
            outcome.error,
            Some(DispatchError::InvalidToolArguments { .. })
        ));
    }

    #[tokio::test]
    async fn adapter_failure_is_error_result() {
        let d = dispatcher(Duration::ZERO, DispatcherConfig::default());
        let outcome = d.execute(&all_allowed(), &call("fail", json!({}))).await;

        assert!(outcome.result.is_error);
        assert!(outcome.result.content.contains("deliberate failure"));
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let mut config = DispatcherConfig::default();
        config
            .timeouts
            .insert("echo".into(), Duration::from_millis(20));
        let d = dispatcher(Duration::from_secs(5), config);

        let outcome = d
            .execute(&all_allowed(), &call("echo", json!({"text": "hi"})))
            .await;
        assert!(outcome.result.is_error);
        assert!(matches!(
            outcome.error,
            Some(DispatchError::ToolTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn long_output_is_truncated_but_kept_in_full() {
        let config = DispatcherConfig {
            display_limit: 10,
            ..DispatcherConfig::default()
        };
        let d = dispatcher(Duration::ZERO, config);
        let text = "abcdefghijklmnopqrstuvwxyz";
        let outcome = d
            .execute(&all_allowed(), &call("echo", json!({ "text": text })))
            .await;

        assert!(outcome.truncated);
        assert!(outcome.result.content.starts_with("abcdefghij\n"));
        assert_eq!(outcome.full_content, text);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let (shown, truncated) = truncate_for_display("héllo wörld", 4);
        assert!(truncated);
        assert!(shown.starts_with("héll\n"));
        let (shown, truncated) = truncate_for_display("short", 10);
        assert_eq!(shown, "short");
        assert!(!truncated);
    }

    #[test]
    fn definitions_follow_permissions() {
        let d = dispatcher(Duration::ZERO, DispatcherConfig::default());
        let perms = PermissionSet::from_allow_list(["echo"], ["echo", "fail"]);
        let defs = d.definitions_for(&perms);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
    }
}
