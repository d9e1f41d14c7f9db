//! SSE stream parser for the Anthropic Messages API.
//!
//! The streaming format sends `event:` and `data:` lines in standard SSE
//! format.  This module parses those lines into typed [`StreamEvent`] values
//! that the [`super::assembler`] consumes.

use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::types::{BlockKind, StreamDelta, StreamEvent, Usage};

/// Parses raw SSE lines from the Messages API stream.
///
/// Accumulates partial state across calls because SSE events span multiple
/// lines (`event:` followed by `data:`).
#[derive(Debug, Default)]
pub struct SseParser {
    /// The most recently seen `event:` type.
    current_event_type: Option<String>,
}

impl SseParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a single line from the SSE stream.
    ///
    /// Returns `Some(event)` when a complete event has been parsed, `None` for
    /// comment lines, blank lines, or the `event:` prefix line (which just
    /// sets internal state for the next `data:` line).
    pub fn parse_line(&mut self, line: &str) -> Result<Option<StreamEvent>> {
        let line = line.trim_end();

        if line.starts_with(':') || line.is_empty() {
            return Ok(None);
        }

        if let Some(event_type) = line.strip_prefix("event:") {
            self.current_event_type = Some(event_type.trim().to_owned());
            return Ok(None);
        }

        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim_start();
            let event_type = match self.current_event_type.take() {
                Some(t) => t,
                // Some proxies omit `event:` lines; the JSON carries `type`.
                None => serde_json::from_str::<Value>(data)
                    .ok()
                    .and_then(|v| v["type"].as_str().map(String::from))
                    .unwrap_or_else(|| "unknown".into()),
            };

            return self.parse_event(&event_type, data);
        }

        tracing::trace!(line, "ignoring unrecognised SSE line");
        Ok(None)
    }

    /// Parse a (event_type, data_json) pair into a [`StreamEvent`].
    fn parse_event(&self, event_type: &str, data: &str) -> Result<Option<StreamEvent>> {
        match event_type {
            "message_start" => {
                let v = parse_json(data)?;
                let message = &v["message"];
                Ok(Some(StreamEvent::MessageStart {
                    message_id: json_string(message, "id"),
                    model: json_string(message, "model"),
                    input_tokens: json_u32(&message["usage"], "input_tokens"),
                }))
            }

            "content_block_start" => {
                let v = parse_json(data)?;
                let index = json_u32(&v, "index");
                let block = &v["content_block"];
                let kind = match block["type"].as_str().unwrap_or_default() {
                    "text" => BlockKind::Text,
                    "thinking" | "redacted_thinking" => BlockKind::Reasoning,
                    "tool_use" => BlockKind::ToolCall {
                        id: json_string(block, "id"),
                        name: json_string(block, "name"),
                    },
                    other => {
                        tracing::warn!(block_type = other, "unknown content block type");
                        return Ok(None);
                    }
                };

                Ok(Some(StreamEvent::BlockStart { index, kind }))
            }

            "content_block_delta" => {
                let v = parse_json(data)?;
                let index = json_u32(&v, "index");
                let delta_obj = &v["delta"];

                let delta = match delta_obj["type"].as_str().unwrap_or_default() {
                    "text_delta" => StreamDelta::Text(json_string(delta_obj, "text")),
                    "thinking_delta" => StreamDelta::Reasoning(json_string(delta_obj, "thinking")),
                    "input_json_delta" => {
                        StreamDelta::ToolArguments(json_string(delta_obj, "partial_json"))
                    }
                    // Signatures authenticate thinking blocks; nothing to assemble.
                    "signature_delta" => return Ok(None),
                    other => {
                        tracing::warn!(delta_type = other, "unknown delta type");
                        return Ok(None);
                    }
                };

                Ok(Some(StreamEvent::BlockDelta { index, delta }))
            }

            "content_block_stop" => {
                let v = parse_json(data)?;
                Ok(Some(StreamEvent::BlockStop {
                    index: json_u32(&v, "index"),
                }))
            }

            "message_delta" => {
                let v = parse_json(data)?;
                let stop_reason = v["delta"]["stop_reason"].as_str().map(String::from);
                let usage = Usage {
                    input_tokens: json_u32(&v["usage"], "input_tokens"),
                    output_tokens: json_u32(&v["usage"], "output_tokens"),
                };
                Ok(Some(StreamEvent::MessageDelta { stop_reason, usage }))
            }

            "message_stop" => Ok(Some(StreamEvent::MessageStop)),

            "ping" => Ok(Some(StreamEvent::Ping)),

            "error" => {
                let v = parse_json(data)?;
                Err(AgentError::ProviderStreamError {
                    reason: format!(
                        "{}: {}",
                        json_string(&v["error"], "type"),
                        json_string(&v["error"], "message")
                    ),
                })
            }

            _ => {
                if data.trim() == "[DONE]" {
                    Ok(Some(StreamEvent::MessageStop))
                } else {
                    tracing::trace!(event_type, "ignoring unknown SSE event type");
                    Ok(None)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a JSON string, mapping errors to [`AgentError::ProviderParseFailed`].
fn parse_json(data: &str) -> Result<Value> {
    serde_json::from_str(data).map_err(|e| AgentError::ProviderParseFailed {
        reason: format!("invalid JSON in SSE data: {e}"),
    })
}

/// Extract a string field from a JSON value, returning an empty string if
/// missing.
fn json_string(v: &Value, field: &str) -> String {
    v[field].as_str().unwrap_or_default().to_owned()
}

/// Extract a small unsigned integer field, defaulting to zero.
fn json_u32(v: &Value, field: &str) -> u32 {
    v[field]
        .as_u64()
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
