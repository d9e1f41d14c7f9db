//! `run_shell`: one `sh -c` command in the working directory.
//!
//! The dispatcher enforces the time limit by dropping the future; the child
//! is spawned with `kill_on_drop` so a timed-out command does not linger.

use std::process::Stdio;

use async_trait::async_trait;
use duet_agent::tools::require_str;
use duet_agent::{ToolAdapter, ToolDefinition, ToolError};
use serde_json::{Value, json};
use tracing::debug;

use super::Workspace;

/// Cap per output stream before it reaches the dispatcher.
const MAX_OUTPUT_BYTES: usize = 100 * 1024;

pub struct ShellTool {
    workspace: Workspace,
}

impl ShellTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl ToolAdapter for ShellTool {
    fn adapter_id(&self) -> &str {
        "shell"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "run_shell".into(),
            description: "Run a shell command in the working directory and return its exit \
                          code, stdout and stderr."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Command line passed to `sh -c`"}
                },
                "required": ["command"]
            }),
        }]
    }

    async fn execute(&self, _tool_name: &str, arguments: Value) -> Result<String, ToolError> {
        let command = require_str(&arguments, "command")?;
        debug!(command, cwd = %self.workspace.root().display(), "running shell command");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.workspace.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Failed(format!("failed to spawn `sh`: {e}")))?;

        let output = child.wait_with_output().await?;
        let exit_code = output.status.code().unwrap_or(-1);
        debug!(exit_code, "shell command finished");

        let mut report = format!("exit code: {exit_code}");
        for (label, raw) in [("stdout", &output.stdout), ("stderr", &output.stderr)] {
            if !raw.is_empty() {
                report.push_str(&format!("\n--- {label} ---\n{}", truncate_output(raw)));
            }
        }
        Ok(report)
    }
}

fn truncate_output(raw: &[u8]) -> String {
    if raw.len() <= MAX_OUTPUT_BYTES {
        return String::from_utf8_lossy(raw).into_owned();
    }
    let mut s = String::from_utf8_lossy(&raw[..MAX_OUTPUT_BYTES]).into_owned();
    s.push_str("\n... [output truncated at 100 KB]");
    s
}
