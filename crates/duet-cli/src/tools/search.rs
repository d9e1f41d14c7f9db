//! `search_files`: regex search over the files under a directory.

use std::ffi::OsStr;
use std::path::Path;

use async_trait::async_trait;
use duet_agent::tools::require_str;
use duet_agent::{ToolAdapter, ToolDefinition, ToolError};
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::Workspace;

/// Stop after this many matching lines.
const MAX_MATCHES: usize = 200;

/// Directories never descended into.
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules"];

pub struct SearchTool {
    workspace: Workspace,
}

impl SearchTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    /// Walk `start` in file-name order and collect matching lines.
    fn search(root: &Workspace, pattern: &Regex, start: &Path) -> Vec<String> {
        let mut matches = Vec::new();
        let walker = WalkDir::new(start)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !(e.file_type().is_dir() && should_skip(e.file_name()))
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) if entry.file_type().is_file() => entry,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable path");
                    continue;
                }
            };
            // Binary or non-UTF-8 files are skipped.
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            for (n, line) in content.lines().enumerate() {
                if pattern.is_match(line) {
                    matches.push(format!(
                        "{}:{}: {}",
                        root.display(entry.path()),
                        n + 1,
                        line.trim_end()
                    ));
                    if matches.len() >= MAX_MATCHES {
                        return matches;
                    }
                }
            }
        }
        matches
    }
}

fn should_skip(name: &OsStr) -> bool {
    SKIPPED_DIRS.iter().any(|s| name == *s)
}

#[async_trait]
impl ToolAdapter for SearchTool {
    fn adapter_id(&self) -> &str {
        "search"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "search_files".into(),
            description: "Search file contents with a regular expression.  Returns \
                          `path:line: text` for each matching line."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Regular expression"},
                    "path": {"type": "string", "description": "Directory to search, defaults to the working directory"}
                },
                "required": ["pattern"]
            }),
        }]
    }

    async fn execute(&self, _tool_name: &str, arguments: Value) -> Result<String, ToolError> {
        let raw = require_str(&arguments, "pattern")?;
        let pattern = Regex::new(raw).map_err(|e| ToolError::InvalidArgument {
            name: "pattern".into(),
            reason: e.to_string(),
        })?;
        let start = self
            .workspace
            .resolve(arguments.get("path").and_then(Value::as_str).unwrap_or("."))?;
        debug!(pattern = raw, path = %start.display(), "searching files");

        let workspace = self.workspace.clone();
        let matches =
            tokio::task::spawn_blocking(move || Self::search(&workspace, &pattern, &start))
                .await
                .map_err(|e| ToolError::Failed(format!("search task failed: {e}")))?;
        if matches.is_empty() {
            return Ok(format!("no matches for `{raw}`"));
        }
        let mut out = matches.join("\n");
        if matches.len() >= MAX_MATCHES {
            out.push_str(&format!("\n[stopped after {MAX_MATCHES} matches]"));
        }
        Ok(out)
    }
}
