//! Built-in tools offered to both agents.
//!
//! Every tool operates inside one working directory.  Paths supplied by an
//! agent are resolved against it and must not escape it.

mod fs;
mod search;
mod shell;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use duet_agent::{ToolError, ToolRegistry};

pub use fs::FileTools;
pub use search::SearchTool;
pub use shell::ShellTool;

/// The directory the tools are confined to.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Root the tools at `root`, which must exist.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            root: root.as_ref().canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an agent-supplied path and reject anything outside the root.
    ///
    /// The target may not exist yet, so the path is normalized lexically
    /// instead of canonicalized.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let candidate = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            self.root.join(raw)
        };
        let normalized = normalize_path(&candidate);

        if !normalized.starts_with(&self.root) {
            return Err(ToolError::InvalidArgument {
                name: "path".into(),
                reason: format!(
                    "`{raw}` resolves outside the working directory `{}`",
                    self.root.display()
                ),
            });
        }
        Ok(normalized)
    }

    /// A path relative to the root, for messages shown to the agent.
    pub fn display(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".into(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

/// Collapse `.` and `..` components without touching the file system.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if matches!(components.last(), Some(Component::Normal(_))) {
                    components.pop();
                } else {
                    components.push(component);
                }
            }
            Component::CurDir => {}
            _ => components.push(component),
        }
    }
    components.iter().collect()
}

/// Register every built-in tool rooted at `workspace`.
pub fn builtin_registry(workspace: &Workspace) -> duet_agent::Result<ToolRegistry> {
    ToolRegistry::new()
        .with_adapter(Arc::new(FileTools::new(workspace.clone())))?
        .with_adapter(Arc::new(SearchTool::new(workspace.clone())))?
        .with_adapter(Arc::new(ShellTool::new(workspace.clone())))
}
