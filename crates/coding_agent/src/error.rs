use std::path::PathBuf;

use agent_provider::ProviderError;
use context_window::ContextWindowError;
use thiserror::Error;

/// Infrastructure failure executing one tool call.
///
/// These never fail the loop: the registry reports them to the model as a
/// failed tool result.
#[derive(Debug, Error)]
pub enum ToolExecutionError {
    #[error("unknown tool '{name}'")]
    UnknownTool { name: String },

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("path escapes workspace root: {}", path.display())]
    PathEscape { path: PathBuf },

    #[error("invalid path: {message}")]
    InvalidPath { message: String },

    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ToolExecutionError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn invalid_arguments(tool: &str, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.to_string(),
            message: message.into(),
        }
    }
}

/// Terminal failure of one user turn.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("context window error: {0}")]
    Context(#[from] ContextWindowError),

    #[error("could not verify completion after {corrections} corrective retries: {reason}")]
    ReliabilityViolation { corrections: usize, reason: String },

    #[error("step limit exceeded: the model requested tools in more than {limit} cycles")]
    StepLimitExceeded { limit: usize },

    #[error("turn cancelled")]
    Cancelled,
}

impl LoopError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum SubagentError {
    #[error("failed to spawn subagent {id}: {source}")]
    Spawn {
        id: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("subagent {id} panicked")]
    Panicked { id: u64 },

    #[error("subagent {id} failed: {source}")]
    Loop {
        id: u64,
        #[source]
        source: LoopError,
    },
}
