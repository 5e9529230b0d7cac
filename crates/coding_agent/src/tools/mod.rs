//! Host tools the model can call, and the registry that executes them.
//!
//! Every path a tool touches is confined to the [`Workspace`] root. Tool
//! failures of any kind come back as a failed [`ToolResult`] so the model can
//! react; they never abort the loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use agent_provider::{CancelSignal, ToolCallRequest, ToolDefinition, ToolResult};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ToolExecutionError;
use crate::status::StatusSink;

mod bash;
mod fs;
mod status;
mod workspace;

pub use bash::BashTool;
pub use fs::{EditFileTool, ReadFileTool, WriteFileTool};
pub use status::SetStatusTool;
pub use workspace::Workspace;

/// Cap applied to every tool output before it enters the window.
pub const DEFAULT_MAX_TOOL_OUTPUT_BYTES: usize = 64 * 1024;
pub const TRUNCATION_MARKER: &str = "\n[truncated]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub ok: bool,
    pub content: String,
    /// Set by tools whose effect on the workspace is only known per call.
    pub changed_workspace: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            ok: true,
            content: content.into(),
            changed_workspace: false,
        }
    }

    pub fn fail(content: impl Into<String>) -> Self {
        Self {
            ok: false,
            content: content.into(),
            changed_workspace: false,
        }
    }

    /// Marks whether this particular call changed the workspace.
    #[must_use]
    pub fn with_workspace_change(mut self, changed: bool) -> Self {
        self.changed_workspace = changed;
        self
    }
}

/// One executed call as the model loop records it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolExecution {
    pub result: ToolResult,
    /// Whether this call changed files in the workspace. Never set for a
    /// failed call.
    pub changed_workspace: bool,
}

/// Per-call context handed to a tool.
pub struct ToolContext<'a> {
    pub workspace: &'a Workspace,
    pub cancel: &'a CancelSignal,
}

/// One host capability exposed to the model.
///
/// `execute` returns `Ok` for business outcomes, including failures such as a
/// non-zero exit status, and `Err` only when the tool could not run at all.
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Whether every successful call changes files in the workspace. Tools
    /// that only sometimes do report it through
    /// [`ToolOutput::changed_workspace`] instead.
    fn mutates_workspace(&self) -> bool {
        false
    }

    fn execute(
        &self,
        arguments: &Value,
        ctx: &ToolContext<'_>,
    ) -> Result<ToolOutput, ToolExecutionError>;
}

/// Tool executor contract consumed by the model loop.
pub trait ToolExecutor: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Runs `call`. Failures come back as a failed result, never a panic or
    /// an aborted turn.
    fn execute(&self, call: &ToolCallRequest, cancel: &CancelSignal) -> ToolExecution;
}

/// Name-keyed tool set bound to one workspace.
#[derive(Clone)]
pub struct ToolRegistry {
    workspace: Workspace,
    tools: BTreeMap<String, Arc<dyn Tool>>,
    max_output_bytes: usize,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("workspace", &self.workspace)
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("max_output_bytes", &self.max_output_bytes)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            tools: BTreeMap::new(),
            max_output_bytes: DEFAULT_MAX_TOOL_OUTPUT_BYTES,
        }
    }

    /// Registry with `read_file`, `write_file`, `edit_file`, `bash` and `set_status`.
    pub fn builtin(workspace: Workspace, status: StatusSink) -> Self {
        Self::new(workspace)
            .with_tool(ReadFileTool::default())
            .with_tool(WriteFileTool)
            .with_tool(EditFileTool)
            .with_tool(BashTool::default())
            .with_tool(SetStatusTool::new(status))
    }

    /// Registers `tool`, replacing any tool with the same name.
    #[must_use]
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register(Arc::new(tool));
        self
    }

    /// Byte cap for tool output; longer output ends with [`TRUNCATION_MARKER`].
    #[must_use]
    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Adds `tool`, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        self.tools.insert(name, tool);
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Registered tool names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    fn run(&self, call: &ToolCallRequest, cancel: &CancelSignal) -> Result<ToolOutput, ToolExecutionError> {
        let tool = self
            .tools
            .get(&call.tool_name)
            .ok_or_else(|| ToolExecutionError::UnknownTool {
                name: call.tool_name.clone(),
            })?;
        let ctx = ToolContext {
            workspace: &self.workspace,
            cancel,
        };
        let output = tool.execute(&call.arguments, &ctx)?;
        let changed = output.ok && (output.changed_workspace || tool.mutates_workspace());
        Ok(output.with_workspace_change(changed))
    }
}

impl ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }

    fn execute(&self, call: &ToolCallRequest, cancel: &CancelSignal) -> ToolExecution {
        let output = match self.run(call, cancel) {
            Ok(output) => output,
            Err(error) => {
                warn!(call_id = %call.id, tool = %call.tool_name, %error, "tool execution failed");
                ToolOutput::fail(format!("Tool error: {error}"))
            }
        };
        debug!(call_id = %call.id, tool = %call.tool_name, ok = output.ok, changed = output.changed_workspace, bytes = output.content.len(), "tool finished");

        let content = truncate_to_byte_limit(output.content, self.max_output_bytes);
        let result = if output.ok {
            ToolResult::success(&call.id, &call.tool_name, content)
        } else {
            ToolResult::failure(&call.id, &call.tool_name, content)
        };
        ToolExecution {
            result,
            changed_workspace: output.changed_workspace,
        }
    }
}

/// Decodes tool arguments into `T`.
///
/// Arguments that reached the host as unparseable text arrive as a JSON
/// string and are rejected here.
pub fn parse_arguments<T: DeserializeOwned>(
    tool: &str,
    arguments: &Value,
) -> Result<T, ToolExecutionError> {
    match arguments {
        Value::Object(_) => serde_json::from_value(arguments.clone())
            .map_err(|error| ToolExecutionError::invalid_arguments(tool, error.to_string())),
        Value::String(raw) => Err(ToolExecutionError::invalid_arguments(
            tool,
            format!("arguments are not valid JSON: {raw}"),
        )),
        other => Err(ToolExecutionError::invalid_arguments(
            tool,
            format!("expected a JSON object, got {other}"),
        )),
    }
}

/// Cuts `content` to at most `max_bytes` on a char boundary and appends the marker.
pub fn truncate_to_byte_limit(content: String, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content;
    }

    let mut cutoff = max_bytes.min(content.len());
    while cutoff > 0 && !content.is_char_boundary(cutoff) {
        cutoff -= 1;
    }

    let mut truncated = content[..cutoff].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}
