use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use agent_provider::ToolDefinition;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use wait_timeout::ChildExt;

use super::{parse_arguments, Tool, ToolContext, ToolOutput};
use crate::error::ToolExecutionError;

const DEFAULT_BASH_TIMEOUT_SEC: u64 = 30;
const MAX_BASH_TIMEOUT_SEC: u64 = 600;

/// Runs a shell command in the workspace with a timeout.
///
/// A non-zero exit or a timeout is a failed result, not a tool error.
#[derive(Debug, Clone)]
pub struct BashTool {
    default_timeout_sec: u64,
}

impl Default for BashTool {
    fn default() -> Self {
        Self {
            default_timeout_sec: DEFAULT_BASH_TIMEOUT_SEC,
        }
    }
}

impl BashTool {
    /// Timeout used when a call does not pass `timeout_sec`.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout_sec: u64) -> Self {
        self.default_timeout_sec = timeout_sec.max(1);
        self
    }
}

#[derive(Debug, Deserialize)]
struct BashArgs {
    command: String,
    #[serde(default)]
    timeout_sec: Option<u64>,
    #[serde(default)]
    cwd: Option<String>,
}

impl Tool for BashTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "bash".to_string(),
            description: "Run a bash command in the workspace and capture its status, stdout and stderr."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout_sec": {"type": "integer", "minimum": 1},
                    "cwd": {"type": "string", "description": "Directory relative to the workspace root."}
                },
                "required": ["command"]
            }),
        }
    }

    fn execute(
        &self,
        arguments: &Value,
        ctx: &ToolContext<'_>,
    ) -> Result<ToolOutput, ToolExecutionError> {
        let args: BashArgs = parse_arguments("bash", arguments)?;
        if args.command.trim().is_empty() {
            return Err(ToolExecutionError::invalid_arguments(
                "bash",
                "command must not be empty",
            ));
        }
        let timeout = args
            .timeout_sec
            .unwrap_or(self.default_timeout_sec)
            .clamp(1, MAX_BASH_TIMEOUT_SEC);

        let cwd = match args.cwd.as_deref() {
            Some(cwd) => ctx.workspace.resolve_existing(cwd)?,
            None => ctx.workspace.root().to_path_buf(),
        };
        if !cwd.is_dir() {
            return Ok(ToolOutput::fail("Invalid bash cwd: expected a directory"));
        }

        let mut child = Command::new("bash")
            .arg("-lc")
            .arg(&args.command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolExecutionError::io("launching bash command", &cwd, source))?;

        let stdout = drain_pipe(child.stdout.take());
        let stderr = drain_pipe(child.stderr.take());

        let (timed_out, status) = match child.wait_timeout(Duration::from_secs(timeout)) {
            Ok(Some(status)) => (false, status),
            Ok(None) => {
                debug!(timeout, "bash command timed out; killing");
                let _ = child.kill();
                let status = child
                    .wait()
                    .map_err(|source| ToolExecutionError::io("waiting for bash command", &cwd, source))?;
                (true, status)
            }
            Err(source) => {
                let _ = child.kill();
                return Err(ToolExecutionError::io("waiting for bash command", &cwd, source));
            }
        };

        let stdout = join_pipe(stdout);
        let stderr = join_pipe(stderr);
        let status_label = if timed_out {
            format!("timeout after {timeout}s")
        } else {
            format_exit_status(status)
        };

        let content = format!(
            "status: {status_label}\nstdout:\n{}\nstderr:\n{}",
            String::from_utf8_lossy(&stdout),
            String::from_utf8_lossy(&stderr)
        );

        if !timed_out && status.success() {
            Ok(ToolOutput::ok(content))
        } else {
            Ok(ToolOutput::fail(content))
        }
    }
}

fn drain_pipe(pipe: Option<impl Read + Send + 'static>) -> Option<JoinHandle<Vec<u8>>> {
    let mut pipe = pipe?;
    Some(thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes);
        bytes
    }))
}

fn join_pipe(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn format_exit_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit_code={code}"),
        None => "exit_code=terminated_by_signal".to_string(),
    }
}
