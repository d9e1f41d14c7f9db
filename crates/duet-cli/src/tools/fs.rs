//! `read_file`, `write_file` and `list_directory`.

use async_trait::async_trait;
use duet_agent::tools::require_str;
use duet_agent::{ToolAdapter, ToolDefinition, ToolError};
use serde_json::{Value, json};
use tracing::debug;

use super::Workspace;

/// File access rooted at the working directory.
pub struct FileTools {
    workspace: Workspace,
}

impl FileTools {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    async fn read_file(&self, arguments: &Value) -> Result<String, ToolError> {
        let path = self.workspace.resolve(require_str(arguments, "path")?)?;
        debug!(path = %path.display(), "reading file");
        Ok(tokio::fs::read_to_string(&path).await?)
    }

    async fn write_file(&self, arguments: &Value) -> Result<String, ToolError> {
        let path = self.workspace.resolve(require_str(arguments, "path")?)?;
        let content = require_str(arguments, "content")?;
        debug!(path = %path.display(), "writing file");

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(format!(
            "wrote {} bytes to {}",
            content.len(),
            self.workspace.display(&path)
        ))
    }

    async fn list_directory(&self, arguments: &Value) -> Result<String, ToolError> {
        let raw = arguments.get("path").and_then(Value::as_str).unwrap_or(".");
        let path = self.workspace.resolve(raw)?;
        debug!(path = %path.display(), "listing directory");

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();

        if entries.is_empty() {
            return Ok(format!("{} is empty", self.workspace.display(&path)));
        }
        Ok(entries.join("\n"))
    }
}

#[async_trait]
impl ToolAdapter for FileTools {
    fn adapter_id(&self) -> &str {
        "filesystem"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "read_file".into(),
                description: "Read a UTF-8 text file from the working directory.".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "File path, relative to the working directory"}
                    },
                    "required": ["path"]
                }),
            },
            ToolDefinition {
                name: "write_file".into(),
                description: "Create or overwrite a file, creating parent directories as needed."
                    .into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "File path, relative to the working directory"},
                        "content": {"type": "string", "description": "Full new file content"}
                    },
                    "required": ["path", "content"]
                }),
            },
            ToolDefinition {
                name: "list_directory".into(),
                description: "List the entries of a directory.  Directories end with `/`.".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Directory path, defaults to the working directory"}
                    }
                }),
            },
        ]
    }

    async fn execute(&self, tool_name: &str, arguments: Value) -> Result<String, ToolError> {
        match tool_name {
            "read_file" => self.read_file(&arguments).await,
            "write_file" => self.write_file(&arguments).await,
            "list_directory" => self.list_directory(&arguments).await,
            other => Err(ToolError::Failed(format!("unsupported tool `{other}`"))),
        }
    }
}
