//! Delegated sub-tasks running as independent model loops.
//!
//! Each subagent owns a private, smaller [`ContextWindow`] and runs on its
//! own worker thread. The parent only observes a subagent through
//! [`SubagentSupervisor::join`], whose report becomes one tool result in the
//! parent's window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use agent_provider::{CancelSignal, ChatBackend, Message, ToolDefinition, ToolResult};
use context_window::ContextWindow;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{LoopError, SubagentError, ToolExecutionError};
use crate::model_loop::{LoopConfig, ModelLoop, TurnOutcome};
use crate::reliability::{EvidenceKind, ReliabilityContract, VerdictReason};
use crate::tools::{parse_arguments, Tool, ToolContext, ToolExecutor, ToolOutput};

pub const DEFAULT_SUBAGENT_MAX_STEPS: usize = 12;
pub const DEFAULT_SUBAGENT_MAX_CORRECTIONS: usize = 1;
pub const DEFAULT_SUBAGENT_WINDOW_BYTES: usize = 64 * 1024;
pub const MAX_DELEGATED_TASKS: usize = 4;

const SUBAGENT_INSTRUCTIONS: &str = "You are a focused worker agent handling one delegated \
sub-task for a parent agent. Complete only that sub-task using the tools, then reply with a short \
report of what you did and what you found.";

/// Resource bounds for one subagent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubagentBudget {
    pub max_steps: usize,
    pub max_corrections: usize,
    pub window_budget_bytes: usize,
}

impl Default for SubagentBudget {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_SUBAGENT_MAX_STEPS,
            max_corrections: DEFAULT_SUBAGENT_MAX_CORRECTIONS,
            window_budget_bytes: DEFAULT_SUBAGENT_WINDOW_BYTES,
        }
    }
}

/// Final state of one subagent.
#[derive(Debug)]
pub struct SubagentReport {
    pub id: u64,
    pub task: String,
    pub result: Result<TurnOutcome, SubagentError>,
}

impl SubagentReport {
    /// Whether the subagent's loop ended with an accepted outcome.
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    /// Whether the subagent was accepted on the strength of a workspace change
    /// of its own.
    pub fn changed_workspace(&self) -> bool {
        matches!(
            &self.result,
            Ok(outcome) if matches!(
                outcome.verdict.reason,
                VerdictReason::Evidence(EvidenceKind::WorkspaceChange { .. })
            )
        )
    }

    /// Renders the report as the single tool result handed to the parent.
    pub fn to_tool_result(&self, tool_call_id: &str, tool_name: &str) -> ToolResult {
        match &self.result {
            Ok(outcome) => ToolResult::success(tool_call_id, tool_name, outcome.text.clone()),
            Err(error) => ToolResult::failure(tool_call_id, tool_name, error.to_string()),
        }
    }
}

pub struct SubagentHandle {
    id: u64,
    task: String,
    cancel: CancelSignal,
    join: JoinHandle<Result<TurnOutcome, LoopError>>,
}

impl std::fmt::Debug for SubagentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubagentHandle")
            .field("id", &self.id)
            .field("task", &self.task)
            .field("finished", &self.join.is_finished())
            .finish()
    }
}

impl SubagentHandle {
    /// Supervisor-assigned id, increasing in spawn order.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Non-blocking check on the worker thread.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel flag observed by this subagent's loop.
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }
}

/// Spawns and joins subagents sharing one backend.
///
/// The backend, and through it the credential resolver, is the only state
/// shared between subagents.
pub struct SubagentSupervisor {
    backend: Arc<dyn ChatBackend>,
    tools: Arc<dyn ToolExecutor>,
    reliability: ReliabilityContract,
    instructions: String,
    next_id: AtomicU64,
}

impl std::fmt::Debug for SubagentSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubagentSupervisor")
            .field("profile", &self.backend.profile())
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl SubagentSupervisor {
    /// `tools` is the executor subagents use; it should not itself delegate.
    pub fn new(backend: Arc<dyn ChatBackend>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            backend,
            tools,
            reliability: ReliabilityContract::default(),
            instructions: SUBAGENT_INSTRUCTIONS.to_string(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Contract every spawned subagent is held to.
    #[must_use]
    pub fn with_reliability(mut self, reliability: ReliabilityContract) -> Self {
        self.reliability = reliability;
        self
    }

    /// Overrides the worker system instructions.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Starts `subtask` on a new worker thread with its own loop and window.
    pub fn spawn(
        &self,
        subtask: &str,
        budget: SubagentBudget,
        cancel: CancelSignal,
    ) -> Result<SubagentHandle, SubagentError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let config = LoopConfig::default()
            .with_instructions(self.instructions.clone())
            .with_max_steps(budget.max_steps)
            .with_max_corrections(budget.max_corrections);
        let mut model_loop = ModelLoop::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.tools),
            config,
        )
        .with_reliability(self.reliability.clone());
        let mut window = ContextWindow::new().with_budget(budget.window_budget_bytes);

        let task = subtask.to_string();
        let worker_task = task.clone();
        let worker_cancel = Arc::clone(&cancel);
        let join = thread::Builder::new()
            .name(format!("subagent-{id}"))
            .spawn(move || {
                model_loop.run_turn(&mut window, &worker_task, &worker_cancel, &mut |_| {})
            })
            .map_err(|source| SubagentError::Spawn { id, source })?;

        info!(subagent = id, task = %task, "subagent spawned");
        Ok(SubagentHandle {
            id,
            task,
            cancel,
            join,
        })
    }

    /// Blocks until the subagent terminates.
    pub fn join(&self, handle: SubagentHandle) -> SubagentReport {
        let SubagentHandle { id, task, join, .. } = handle;
        let result = match join.join() {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(source)) => Err(SubagentError::Loop { id, source }),
            Err(_) => Err(SubagentError::Panicked { id }),
        };

        match &result {
            Ok(outcome) => info!(subagent = id, steps = outcome.steps, "subagent finished"),
            Err(error) => warn!(subagent = id, %error, "subagent failed"),
        }
        SubagentReport { id, task, result }
    }

    /// Joins `handle` and appends its report to the parent's in-progress turn
    /// as one tool message.
    pub fn join_into(
        &self,
        handle: SubagentHandle,
        parent: &mut ContextWindow,
        tool_call_id: &str,
    ) -> Result<SubagentReport, LoopError> {
        let report = self.join(handle);
        let result = report.to_tool_result(tool_call_id, DELEGATE_TOOL_NAME);
        parent.push_message(Message::tool_result(&result))?;
        Ok(report)
    }
}

pub const DELEGATE_TOOL_NAME: &str = "delegate";

/// Runs sub-tasks concurrently through a [`SubagentSupervisor`] and returns
/// their joined reports as one result.
///
/// A call counts as a workspace change only when it succeeded and at least one
/// subagent was accepted on workspace-change evidence. Reports alone prove
/// nothing.
#[derive(Debug, Clone)]
pub struct DelegateTool {
    supervisor: Arc<SubagentSupervisor>,
    budget: SubagentBudget,
}

impl DelegateTool {
    pub fn new(supervisor: Arc<SubagentSupervisor>) -> Self {
        Self {
            supervisor,
            budget: SubagentBudget::default(),
        }
    }

    /// Bounds applied to each subagent this tool spawns.
    #[must_use]
    pub fn with_budget(mut self, budget: SubagentBudget) -> Self {
        self.budget = budget;
        self
    }
}

#[derive(Debug, Deserialize)]
struct DelegateArgs {
    #[serde(default)]
    tasks: Vec<String>,
    #[serde(default)]
    task: Option<String>,
}

impl Tool for DelegateTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: DELEGATE_TOOL_NAME.to_string(),
            description: format!(
                "Run up to {MAX_DELEGATED_TASKS} independent sub-tasks concurrently with worker agents and return their reports."
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tasks": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Self-contained sub-task descriptions."
                    }
                },
                "required": ["tasks"]
            }),
        }
    }

    fn execute(
        &self,
        arguments: &Value,
        ctx: &ToolContext<'_>,
    ) -> Result<ToolOutput, ToolExecutionError> {
        let args: DelegateArgs = parse_arguments(DELEGATE_TOOL_NAME, arguments)?;
        let tasks: Vec<String> = args
            .tasks
            .into_iter()
            .chain(args.task)
            .map(|task| task.trim().to_string())
            .filter(|task| !task.is_empty())
            .collect();

        if tasks.is_empty() {
            return Err(ToolExecutionError::invalid_arguments(
                DELEGATE_TOOL_NAME,
                "at least one non-empty task is required",
            ));
        }
        if tasks.len() > MAX_DELEGATED_TASKS {
            return Err(ToolExecutionError::invalid_arguments(
                DELEGATE_TOOL_NAME,
                format!("at most {MAX_DELEGATED_TASKS} tasks may be delegated at once"),
            ));
        }

        let mut handles = Vec::with_capacity(tasks.len());
        let mut spawn_failures = Vec::new();
        for task in &tasks {
            match self
                .supervisor
                .spawn(task, self.budget, Arc::clone(ctx.cancel))
            {
                Ok(handle) => handles.push(handle),
                Err(error) => spawn_failures.push(format!("{task}: {error}")),
            }
        }

        let reports: Vec<SubagentReport> = handles
            .into_iter()
            .map(|handle| self.supervisor.join(handle))
            .collect();

        let ok = spawn_failures.is_empty() && reports.iter().all(SubagentReport::succeeded);
        let mut sections: Vec<String> = reports
            .iter()
            .enumerate()
            .map(|(index, report)| {
                let body = match &report.result {
                    Ok(outcome) => outcome.text.clone(),
                    Err(error) => format!("FAILED: {error}"),
                };
                format!("## Subtask {}: {}\n{body}", index + 1, report.task)
            })
            .collect();
        sections.extend(
            spawn_failures
                .into_iter()
                .map(|failure| format!("## Not started\n{failure}")),
        );

        let changed = reports.iter().any(SubagentReport::changed_workspace);
        let content = sections.join("\n\n");
        let output = if ok {
            ToolOutput::ok(content)
        } else {
            ToolOutput::fail(content)
        };
        Ok(output.with_workspace_change(changed))
    }
}
