use std::fs;

use agent_provider::ToolDefinition;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_arguments, Tool, ToolContext, ToolOutput};
use crate::error::ToolExecutionError;

const DEFAULT_READ_MAX_BYTES: usize = 200 * 1024;

#[derive(Debug, Clone)]
pub struct ReadFileTool {
    max_bytes: usize,
}

impl Default for ReadFileTool {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_READ_MAX_BYTES,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReadFileArgs {
    path: String,
}

impl Tool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".to_string(),
            description: "Read a UTF-8 text file from the workspace.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the workspace root."}
                },
                "required": ["path"]
            }),
        }
    }

    fn execute(
        &self,
        arguments: &Value,
        ctx: &ToolContext<'_>,
    ) -> Result<ToolOutput, ToolExecutionError> {
        let args: ReadFileArgs = parse_arguments("read_file", arguments)?;
        let resolved = ctx.workspace.resolve_existing(&args.path)?;

        let bytes = match fs::read(&resolved) {
            Ok(bytes) => bytes,
            Err(error) => {
                return Ok(ToolOutput::fail(format!(
                    "Failed to read file {}: {error}",
                    ctx.workspace.relative_display(&resolved)
                )));
            }
        };

        if bytes.len() > self.max_bytes {
            return Ok(ToolOutput::fail(format!(
                "File exceeds max read size ({} bytes > {} bytes)",
                bytes.len(),
                self.max_bytes
            )));
        }

        match String::from_utf8(bytes) {
            Ok(content) => Ok(ToolOutput::ok(content)),
            Err(_) => Ok(ToolOutput::fail("File is not valid UTF-8 text")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFileTool;

#[derive(Debug, Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

impl Tool for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_file".to_string(),
            description: "Create or overwrite a file in the workspace, creating parent directories."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        }
    }

    fn mutates_workspace(&self) -> bool {
        true
    }

    fn execute(
        &self,
        arguments: &Value,
        ctx: &ToolContext<'_>,
    ) -> Result<ToolOutput, ToolExecutionError> {
        let args: WriteFileArgs = parse_arguments("write_file", arguments)?;
        let resolved = ctx.workspace.resolve_write(&args.path)?;

        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).map_err(|source| {
                ToolExecutionError::io("creating parent directories", parent, source)
            })?;
            let canonical_parent = parent
                .canonicalize()
                .map_err(|source| ToolExecutionError::io("resolving write parent", parent, source))?;
            ctx.workspace.ensure_inside(&canonical_parent)?;
        }

        if let Err(error) = fs::write(&resolved, &args.content) {
            return Ok(ToolOutput::fail(format!(
                "Failed to write file {}: {error}",
                ctx.workspace.relative_display(&resolved)
            )));
        }

        Ok(ToolOutput::ok(format!(
            "Wrote {} ({} bytes)",
            ctx.workspace.relative_display(&resolved),
            args.content.len()
        )))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EditFileTool;

#[derive(Debug, Deserialize)]
struct EditFileArgs {
    path: String,
    old_text: String,
    new_text: String,
}

impl Tool for EditFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "edit_file".to_string(),
            description: "Replace exactly one occurrence of old_text with new_text in a file."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_text": {"type": "string"},
                    "new_text": {"type": "string"}
                },
                "required": ["path", "old_text", "new_text"]
            }),
        }
    }

    fn mutates_workspace(&self) -> bool {
        true
    }

    fn execute(
        &self,
        arguments: &Value,
        ctx: &ToolContext<'_>,
    ) -> Result<ToolOutput, ToolExecutionError> {
        let args: EditFileArgs = parse_arguments("edit_file", arguments)?;
        if args.old_text.is_empty() {
            return Ok(ToolOutput::fail("old_text must not be empty"));
        }

        let resolved = ctx.workspace.resolve_existing(&args.path)?;
        let display = ctx.workspace.relative_display(&resolved);
        let current_content = match fs::read_to_string(&resolved) {
            Ok(content) => content,
            Err(error) => {
                return Ok(ToolOutput::fail(format!(
                    "Failed to read file {display}: {error}"
                )));
            }
        };

        let occurrence_count = current_content.match_indices(&args.old_text).count();
        if occurrence_count != 1 {
            return Ok(ToolOutput::fail(format!(
                "edit_file requires exactly one match; found {occurrence_count}"
            )));
        }

        let updated_content = current_content.replacen(&args.old_text, &args.new_text, 1);
        if let Err(error) = fs::write(&resolved, updated_content) {
            return Ok(ToolOutput::fail(format!(
                "Failed to write file {display}: {error}"
            )));
        }

        Ok(ToolOutput::ok(format!("Updated {display}")))
    }
}
