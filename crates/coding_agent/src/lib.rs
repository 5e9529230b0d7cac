//! Agent orchestration core: the turn state machine and everything it drives.
//!
//! - [`model_loop`]: `Idle -> AwaitingModel -> ExecutingTools -> ReliabilityCheck`
//!   state machine over a [`context_window::ContextWindow`].
//! - [`reliability`]: completion verification for implementation work, with a
//!   pluggable intent classifier.
//! - [`tools`]: the tool capability, the workspace-confined built-ins and the
//!   registry that executes calls.
//! - [`subagent`]: concurrent delegated sub-tasks with private windows.

pub mod commands;
pub mod error;
pub mod model_loop;
pub mod reliability;
pub mod status;
pub mod subagent;
pub mod tools;

pub use error::{LoopError, SubagentError, ToolExecutionError};
pub use model_loop::{LoopConfig, LoopEvent, LoopState, ModelLoop, TurnOutcome, TurnScope};
pub use reliability::{
    IntentClassifier, KeywordClassifier, ReliabilityContract, ReliabilityVerdict, TaskIntent,
};
pub use status::StatusSink;
pub use subagent::{DelegateTool, SubagentBudget, SubagentHandle, SubagentReport, SubagentSupervisor};
pub use tools::{Tool, ToolExecution, ToolExecutor, ToolOutput, ToolRegistry, Workspace};

/// Trimmed override, or the built-in instructions when unset or blank.
pub fn system_instructions_or_default(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => model_loop::DEFAULT_SYSTEM_INSTRUCTIONS.to_string(),
    }
}
