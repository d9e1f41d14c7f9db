//! Tool layer.
//!
//! Concrete tools live outside this crate and plug in through the
//! [`ToolAdapter`] trait.  The [`ToolRegistry`] owns the adapters together
//! with their compiled argument schemas, each session carries its own
//! [`PermissionSet`], and the [`ToolDispatcher`] turns a tool call into a
//! tool result without ever failing the turn.

pub mod dispatcher;
pub mod permissions;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::types::ToolDefinition;

pub use dispatcher::{DispatchError, DispatchOutcome, DispatcherConfig, ToolDispatcher};
pub use permissions::PermissionSet;

// ---------------------------------------------------------------------------
// Tool adapter trait
// ---------------------------------------------------------------------------

/// Failure reported by a tool implementation.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// An argument was present but unusable (bad path, empty pattern, ...).
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: String, reason: String },

    /// The underlying I/O operation failed.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Any other failure, already phrased for the agent.
    #[error("{0}")]
    Failed(String),
}

/// Trait for components that execute tool calls on behalf of an agent.
///
/// Adapters (filesystem, shell, search, ...) implement this trait so the
/// dispatcher can invoke their tools uniformly.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// The unique identifier for this adapter.
    fn adapter_id(&self) -> &str;

    /// Returns the tool definitions this adapter exposes to the agent.
    fn tool_definitions(&self) -> Vec<ToolDefinition>;

    /// Execute a named tool with already-validated arguments.
    ///
    /// Returns the result as a string suitable for feeding back to the agent.
    async fn execute(&self, tool_name: &str, arguments: Value)
    -> std::result::Result<String, ToolError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A tool with its owning adapter and compiled schema.
pub(crate) struct RegisteredTool {
    pub(crate) adapter: Arc<dyn ToolAdapter>,
    pub(crate) definition: ToolDefinition,
    pub(crate) schema: JSONSchema,
}

/// All tools known to the process, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every tool an adapter exposes.
    ///
    /// Fails on duplicate tool names and on parameter schemas that do not
    /// compile.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) -> Result<()> {
        for definition in adapter.tool_definitions() {
            if self.tools.contains_key(&definition.name) {
                return Err(AgentError::ConfigError {
                    reason: format!("tool `{}` registered twice", definition.name),
                });
            }

            let schema = JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(&definition.input_schema)
                .map_err(|e| AgentError::ConfigError {
                    reason: format!("invalid schema for tool `{}`: {e}", definition.name),
                })?;

            tracing::debug!(
                adapter = adapter.adapter_id(),
                tool = %definition.name,
                "registered tool"
            );

            self.tools.insert(
                definition.name.clone(),
                RegisteredTool {
                    adapter: Arc::clone(&adapter),
                    definition,
                    schema,
                },
            );
        }
        Ok(())
    }

    /// Builder form of [`Self::register`].
    pub fn with_adapter(mut self, adapter: Arc<dyn ToolAdapter>) -> Result<Self> {
        self.register(adapter)?;
        Ok(self)
    }

    /// Whether a tool with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// The definition of a tool.
    pub fn definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name).map(|t| &t.definition)
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Read a required string argument.
///
/// Adapters receive arguments after schema validation, but a schema may be
/// looser than the adapter, so this still reports a precise field error.
pub fn require_str<'a>(
    arguments: &'a Value,
    name: &str,
) -> std::result::Result<&'a str, ToolError> {
    arguments
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArgument {
            name: name.to_owned(),
            reason: "missing or not a string".into(),
        })
}
