//! File operation tools for reading, writing, and navigating the workspace.
//!
//! Every tool is rooted at the workspace directory:
//! - Paths are resolved against the root and may not escape it
//! - Each tool reports the exact path it will touch as an [`Action`]
//! - Size limits on read/write operations

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tokio::fs;

use crate::tools::builtin::path_utils::{absolutize, ensure_within};
use crate::tools::tool::{Action, FileOp, Tool, ToolContext, ToolError, ToolOutput, require_str};

/// Maximum file size for reading (10MB).
const MAX_READ_SIZE: u64 = 10 * 1024 * 1024;

/// Maximum file size for writing (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

/// Maximum directory listing entries.
const MAX_DIR_ENTRIES: usize = 500;

/// Bytes inspected for NUL when deciding whether a file is binary.
const BINARY_SNIFF_LEN: usize = 1024;

/// Resolve the path a file tool operates on.
///
/// The dispatcher passes the already-classified action through the context;
/// only when it is absent (direct calls in tests) are the params re-read.
fn target_path(
    root: &Path,
    params: &serde_json::Value,
    ctx: &ToolContext,
    default: Option<&str>,
) -> Result<PathBuf, ToolError> {
    let path = match &ctx.action {
        Some(Action::File { path, .. }) => path.clone(),
        _ => {
            let raw = match default {
                Some(d) => params.get("path").and_then(|v| v.as_str()).unwrap_or(d),
                None => require_str(params, "path")?,
            };
            absolutize(raw, root)?
        }
    };
    ensure_within(&path, root)?;
    Ok(path)
}

fn file_action(
    root: &Path,
    params: &serde_json::Value,
    op: FileOp,
    default: Option<&str>,
) -> Result<Option<Action>, ToolError> {
    let raw = match default {
        Some(d) => params.get("path").and_then(|v| v.as_str()).unwrap_or(d),
        None => require_str(params, "path")?,
    };
    let path = absolutize(raw, root)?;
    Ok(Some(Action::File { op, path }))
}

fn io_error(context: &str, e: std::io::Error) -> ToolError {
    ToolError::ExecutionFailed(format!("{}: {}", context, e))
}

/// Read file contents tool.
#[derive(Debug)]
pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace. Returns numbered lines. \
         For large files, specify offset (1-indexed start line) and limit (line count)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read, relative to the workspace"
                },
                "offset": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Line number to start reading from (1-indexed, optional)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of lines to read (optional)"
                }
            },
            "required": ["path"]
        })
    }

    fn action(&self, params: &serde_json::Value) -> Result<Option<Action>, ToolError> {
        file_action(&self.root, params, FileOp::Read, None)
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let path = target_path(&self.root, &params, ctx, None)?;
        let offset = params.get("offset").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
        let limit = params.get("limit").and_then(|v| v.as_u64()).map(|l| l as usize);

        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| io_error("Cannot access file", e))?;
        if !metadata.is_file() {
            return Err(ToolError::ExecutionFailed(format!(
                "{} is not a file",
                path.display()
            )));
        }
        if metadata.len() > MAX_READ_SIZE {
            return Err(ToolError::ExecutionFailed(format!(
                "File too large ({} bytes). Maximum is {} bytes.",
                metadata.len(),
                MAX_READ_SIZE
            )));
        }

        let bytes = fs::read(&path)
            .await
            .map_err(|e| io_error("Failed to read file", e))?;

        if bytes.iter().take(BINARY_SNIFF_LEN).any(|&b| b == 0) {
            let result = serde_json::json!({
                "path": path.display().to_string(),
                "binary": true,
                "size": metadata.len(),
            });
            return Ok(ToolOutput::success(result, start.elapsed()));
        }

        let content = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();

        let start_line = offset.saturating_sub(1).min(total_lines);
        let end_line = match limit {
            Some(lim) => start_line.saturating_add(lim).min(total_lines),
            None => total_lines,
        };

        let selected: Vec<String> = lines[start_line..end_line]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>6}│ {}", start_line + i + 1, line))
            .collect();

        let result = serde_json::json!({
            "path": path.display().to_string(),
            "content": selected.join("\n"),
            "total_lines": total_lines,
            "lines_shown": end_line - start_line,
        });

        Ok(ToolOutput::success(result, start.elapsed()))
    }
}

/// List directory contents tool.
#[derive(Debug)]
pub struct ListDirTool {
    root: PathBuf,
}

impl ListDirTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List the contents of a workspace directory with file sizes. \
         Directories are listed first and end with '/'."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (defaults to the workspace root)"
                },
                "recursive": {
                    "type": "boolean",
                    "description": "If true, list contents recursively (default false)"
                },
                "max_depth": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Maximum depth for recursive listing (default 3)"
                },
                "show_hidden": {
                    "type": "boolean",
                    "description": "Include entries starting with '.' (default false)"
                }
            },
            "required": []
        })
    }

    fn action(&self, params: &serde_json::Value) -> Result<Option<Action>, ToolError> {
        file_action(&self.root, params, FileOp::List, Some("."))
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let path = target_path(&self.root, &params, ctx, Some("."))?;

        let options = ListOptions {
            recursive: params
                .get("recursive")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            max_depth: params
                .get("max_depth")
                .and_then(|v| v.as_u64())
                .unwrap_or(3) as usize,
            show_hidden: params
                .get("show_hidden")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        };

        let mut entries = Vec::new();
        list_dir_inner(&path, &path, &options, 0, &mut entries).await?;

        entries.sort_by(|a, b| {
            let a_is_dir = a.ends_with('/');
            let b_is_dir = b.ends_with('/');
            match (a_is_dir, b_is_dir) {
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                _ => a.cmp(b),
            }
        });

        let truncated = entries.len() >= MAX_DIR_ENTRIES;
        entries.truncate(MAX_DIR_ENTRIES);

        let result = serde_json::json!({
            "path": path.display().to_string(),
            "entries": entries,
            "count": entries.len(),
            "truncated": truncated
        });

        Ok(ToolOutput::success(result, start.elapsed()))
    }
}

struct ListOptions {
    recursive: bool,
    max_depth: usize,
    show_hidden: bool,
}

/// Recursively list directory contents.
async fn list_dir_inner(
    base: &Path,
    path: &Path,
    options: &ListOptions,
    current_depth: usize,
    entries: &mut Vec<String>,
) -> Result<(), ToolError> {
    if entries.len() >= MAX_DIR_ENTRIES {
        return Ok(());
    }

    let mut dir = fs::read_dir(path)
        .await
        .map_err(|e| io_error("Failed to read directory", e))?;

    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| io_error("Failed to read entry", e))?
    {
        if entries.len() >= MAX_DIR_ENTRIES {
            break;
        }

        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if !options.show_hidden && name_str.starts_with('.') {
            continue;
        }

        let entry_path = entry.path();
        let relative = entry_path
            .strip_prefix(base)
            .unwrap_or(&entry_path)
            .to_string_lossy()
            .into_owned();

        // symlink_metadata so a link to a directory is not followed out of the root
        let metadata = fs::symlink_metadata(&entry_path).await.ok();
        let is_dir = metadata.as_ref().is_some_and(|m| m.is_dir());

        if is_dir {
            entries.push(format!("{}/", relative));
        } else {
            let size = metadata.as_ref().map(|m| m.len()).unwrap_or(0);
            entries.push(format!("{} ({})", relative, format_size(size)));
        }

        if options.recursive && is_dir && current_depth < options.max_depth {
            Box::pin(list_dir_inner(
                base,
                &entry_path,
                options,
                current_depth + 1,
                entries,
            ))
            .await?;
        }
    }

    Ok(())
}

/// Format file size in human-readable form.
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Write file contents tool.
#[derive(Debug)]
pub struct WriteFileTool {
    root: PathBuf,
}

impl WriteFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a workspace file. Creates the file if it doesn't exist, \
         overwrites it if it does (keeping a .backup copy unless backup is false). \
         Parent directories are created automatically. Use apply_patch for targeted edits."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                },
                "backup": {
                    "type": "boolean",
                    "description": "Copy an existing file to <path>.backup first (default true)"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn action(&self, params: &serde_json::Value) -> Result<Option<Action>, ToolError> {
        file_action(&self.root, params, FileOp::Write, None)
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let content = require_str(&params, "content")?;
        let backup = params
            .get("backup")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        if content.len() > MAX_WRITE_SIZE {
            return Err(ToolError::InvalidParameters(format!(
                "Content too large ({} bytes). Maximum is {} bytes.",
                content.len(),
                MAX_WRITE_SIZE
            )));
        }

        let path = target_path(&self.root, &params, ctx, None)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("Failed to create directories", e))?;
        }

        let mut backup_path = None;
        if backup && fs::try_exists(&path).await.unwrap_or(false) {
            let mut name = path.clone().into_os_string();
            name.push(".backup");
            let target = PathBuf::from(name);
            fs::copy(&path, &target)
                .await
                .map_err(|e| io_error("Failed to create backup", e))?;
            backup_path = Some(target);
        }

        fs::write(&path, content)
            .await
            .map_err(|e| io_error("Failed to write file", e))?;

        let result = serde_json::json!({
            "path": path.display().to_string(),
            "bytes_written": content.len(),
            "backup_path": backup_path.map(|p| p.display().to_string()),
        });

        Ok(ToolOutput::success(result, start.elapsed()))
    }
}

/// Apply patch tool for targeted file edits.
#[derive(Debug)]
pub struct ApplyPatchTool {
    root: PathBuf,
}

impl ApplyPatchTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Apply a targeted edit to a workspace file using search/replace. Finds the exact \
         'old_string' and replaces it with 'new_string'. The old_string must match exactly \
         (including whitespace and indentation)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to edit"
                },
                "old_string": {
                    "type": "string",
                    "minLength": 1,
                    "description": "The exact string to find and replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "The string to replace it with"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "If true, replace all occurrences (default false, replaces first only)"
                }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn action(&self, params: &serde_json::Value) -> Result<Option<Action>, ToolError> {
        file_action(&self.root, params, FileOp::Edit, None)
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let old_string = require_str(&params, "old_string")?;
        let new_string = require_str(&params, "new_string")?;
        let replace_all = params
            .get("replace_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if old_string.is_empty() {
            return Err(ToolError::InvalidParameters(
                "old_string must not be empty".into(),
            ));
        }

        let path = target_path(&self.root, &params, ctx, None)?;

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| io_error("Failed to read file", e))?;

        let occurrences = content.matches(old_string).count();
        if occurrences == 0 {
            return Err(ToolError::ExecutionFailed(format!(
                "Could not find the specified text in {}. Make sure old_string matches exactly.",
                path.display()
            )));
        }

        let (new_content, replacements) = if replace_all {
            (content.replace(old_string, new_string), occurrences)
        } else {
            (content.replacen(old_string, new_string, 1), 1)
        };

        fs::write(&path, &new_content)
            .await
            .map_err(|e| io_error("Failed to write file", e))?;

        let result = serde_json::json!({
            "path": path.display().to_string(),
            "replacements": replacements,
        });

        Ok(ToolOutput::success(result, start.elapsed()))
    }
}

/// Delete a file or directory tree.
#[derive(Debug)]
pub struct DeleteFileTool {
    root: PathBuf,
}

impl DeleteFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file or a directory (recursively) in the workspace. \
         The user is always asked to confirm."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file or directory to delete"
                }
            },
            "required": ["path"]
        })
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn action(&self, params: &serde_json::Value) -> Result<Option<Action>, ToolError> {
        file_action(&self.root, params, FileOp::Delete, None)
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let path = target_path(&self.root, &params, ctx, None)?;

        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        if path == root || path == self.root {
            return Err(ToolError::NotAuthorized(
                "Refusing to delete the workspace root".into(),
            ));
        }

        let metadata = fs::symlink_metadata(&path)
            .await
            .map_err(|e| io_error("Cannot access path", e))?;

        let deleted_type = if metadata.is_dir() {
            fs::remove_dir_all(&path)
                .await
                .map_err(|e| io_error("Failed to delete directory", e))?;
            "directory"
        } else {
            fs::remove_file(&path)
                .await
                .map_err(|e| io_error("Failed to delete file", e))?;
            "file"
        };

        let result = serde_json::json!({
            "path": path.display().to_string(),
            "deleted_type": deleted_type,
        });

        Ok(ToolOutput::success(result, start.elapsed()))
    }
}
