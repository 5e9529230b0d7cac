//! Turn state machine driving one user request to a verified outcome.
//!
//! ```text
//! Idle -> AwaitingModel -> ExecutingTools -> AwaitingModel -> ... -> ReliabilityCheck
//!                                                                  |-> Idle        (accepted)
//!                                                                  |-> AwaitingModel (corrective retry)
//!                                                                  '-> Terminated  (retries exhausted)
//! ```
//!
//! Cancellation is observed at the top of every transition. The in-progress
//! turn is closed and flushed on every exit path by [`TurnScope`].

use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use agent_provider::{
    CancelSignal, ChatBackend, ChatRequest, ChatResult, Message, ProviderError,
    ProviderErrorKind, ProviderProfile, ToolCallRequest, ToolResult,
};
use context_window::ContextWindow;
use tracing::{debug, info, warn};

use crate::error::LoopError;
use crate::reliability::{
    ReliabilityContract, ReliabilityVerdict, ToolEvidence, CORRECTIVE_INSTRUCTION,
};
use crate::tools::ToolExecutor;

pub const DEFAULT_MAX_STEPS: usize = 24;
pub const DEFAULT_MAX_CORRECTIONS: usize = 2;
pub const DEFAULT_SYSTEM_INSTRUCTIONS: &str =
    "You are a careful coding agent working inside the user's project directory. Use the tools to \
inspect and change files, verify your work, and report concretely what you changed. If you cannot \
finish, name the specific blocker.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    AwaitingModel,
    ExecutingTools,
    ReliabilityCheck,
    Terminated,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingModel => "awaiting_model",
            Self::ExecutingTools => "executing_tools",
            Self::ReliabilityCheck => "reliability_check",
            Self::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub instructions: String,
    /// Maximum `AwaitingModel -> ExecutingTools` cycles per user turn.
    pub max_steps: usize,
    /// Maximum corrective retries per user turn.
    pub max_corrections: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            instructions: DEFAULT_SYSTEM_INSTRUCTIONS.to_string(),
            max_steps: DEFAULT_MAX_STEPS,
            max_corrections: DEFAULT_MAX_CORRECTIONS,
        }
    }
}

impl LoopConfig {
    /// System instructions sent ahead of the window on every model call.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Tool-cycle limit per turn; clamped to at least one.
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Corrective retries allowed before the turn fails the reliability check.
    #[must_use]
    pub fn with_max_corrections(mut self, max_corrections: usize) -> Self {
        self.max_corrections = max_corrections;
        self
    }
}

/// Progress notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    StateChanged { from: LoopState, to: LoopState },
    TextDelta(String),
    ToolStarted(ToolCallRequest),
    ToolFinished(ToolResult),
    CorrectiveRetry { attempt: usize, reason: String },
    /// Last event of every turn: the accepted outcome, or the rendered error.
    Finished(Result<TurnOutcome, String>),
}

/// Successful end of one user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub text: String,
    pub steps: usize,
    pub corrections: usize,
    pub verdict: ReliabilityVerdict,
}

/// Ownership region for one user turn.
///
/// Holds the window exclusively together with the per-turn scratch state.
/// Dropping the scope closes the in-progress turn and flushes the window, on
/// success, error and cancellation alike.
pub struct TurnScope<'w> {
    window: &'w mut ContextWindow,
    evidence: Vec<ToolEvidence>,
    steps: usize,
    corrections: usize,
}

impl<'w> TurnScope<'w> {
    pub fn begin(window: &'w mut ContextWindow, request: &str) -> Result<Self, LoopError> {
        let turn_id = window.begin_turn(Message::user(request))?;
        debug!(turn = %turn_id, "turn started");
        Ok(Self {
            window,
            evidence: Vec::new(),
            steps: 0,
            corrections: 0,
        })
    }

    fn push(&mut self, message: Message) -> Result<(), LoopError> {
        self.window.push_message(message)?;
        Ok(())
    }
}

impl Deref for TurnScope<'_> {
    type Target = ContextWindow;

    fn deref(&self) -> &Self::Target {
        self.window
    }
}

impl DerefMut for TurnScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.window
    }
}

impl Drop for TurnScope<'_> {
    fn drop(&mut self) {
        if self.window.current_turn().is_none() {
            return;
        }
        if let Err(error) = self.window.close_current_turn() {
            warn!(%error, "failed to persist context window at end of turn");
        }
    }
}

/// Model loop bound to one backend and one tool executor.
pub struct ModelLoop {
    backend: Arc<dyn ChatBackend>,
    tools: Arc<dyn ToolExecutor>,
    reliability: ReliabilityContract,
    config: LoopConfig,
    state: LoopState,
}

impl std::fmt::Debug for ModelLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLoop")
            .field("profile", &self.backend.profile())
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ModelLoop {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        tools: Arc<dyn ToolExecutor>,
        config: LoopConfig,
    ) -> Self {
        Self {
            backend,
            tools,
            reliability: ReliabilityContract::default(),
            config,
            state: LoopState::Idle,
        }
    }

    /// Replaces the default keyword-based contract.
    #[must_use]
    pub fn with_reliability(mut self, reliability: ReliabilityContract) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn profile(&self) -> ProviderProfile {
        self.backend.profile()
    }

    /// Swaps the backend and tool executor between turns.
    pub fn replace_backend(&mut self, backend: Arc<dyn ChatBackend>, tools: Arc<dyn ToolExecutor>) {
        self.backend = backend;
        self.tools = tools;
    }

    /// Services one user request against `window`.
    ///
    /// On success the turn was accepted by the reliability contract and the
    /// final assistant text is returned. Every failure is terminal for the
    /// turn; the window keeps whatever the turn produced.
    pub fn run_turn(
        &mut self,
        window: &mut ContextWindow,
        request: &str,
        cancel: &CancelSignal,
        observer: &mut dyn FnMut(LoopEvent),
    ) -> Result<TurnOutcome, LoopError> {
        self.state = LoopState::Idle;
        let result = self.drive(window, request, cancel, observer);
        let end = if result.is_ok() {
            LoopState::Idle
        } else {
            LoopState::Terminated
        };
        if let Err(error) = &result {
            info!(%error, "turn terminated");
        }
        self.transition(end, observer);
        observer(LoopEvent::Finished(
            result.as_ref().cloned().map_err(ToString::to_string),
        ));
        result
    }

    fn drive(
        &mut self,
        window: &mut ContextWindow,
        request: &str,
        cancel: &CancelSignal,
        observer: &mut dyn FnMut(LoopEvent),
    ) -> Result<TurnOutcome, LoopError> {
        if is_cancelled(cancel) {
            return Err(LoopError::Cancelled);
        }

        let intent = self.reliability.classify(request);
        let mut scope = TurnScope::begin(window, request)?;
        debug!(?intent, "classified request");

        self.transition(LoopState::AwaitingModel, observer);
        loop {
            if is_cancelled(cancel) {
                return Err(LoopError::Cancelled);
            }

            let result = self.call_model(&scope, cancel, observer)?;
            if result.tool_calls.is_empty() {
                scope.push(Message::assistant(result.text.clone(), Vec::new()))?;
                self.transition(LoopState::ReliabilityCheck, observer);

                let verdict = self
                    .reliability
                    .evaluate(intent, &result.text, &scope.evidence);
                if verdict.accepted {
                    info!(reason = %verdict.reason, steps = scope.steps, "turn accepted");
                    return Ok(TurnOutcome {
                        text: result.text,
                        steps: scope.steps,
                        corrections: scope.corrections,
                        verdict,
                    });
                }

                if scope.corrections >= self.config.max_corrections {
                    return Err(LoopError::ReliabilityViolation {
                        corrections: scope.corrections,
                        reason: verdict.reason.to_string(),
                    });
                }
                scope.corrections += 1;
                warn!(attempt = scope.corrections, reason = %verdict.reason, "completion claim rejected; issuing corrective retry");
                scope.push(Message::system(CORRECTIVE_INSTRUCTION))?;
                observer(LoopEvent::CorrectiveRetry {
                    attempt: scope.corrections,
                    reason: verdict.reason.to_string(),
                });
                self.transition(LoopState::AwaitingModel, observer);
                continue;
            }

            if scope.steps >= self.config.max_steps {
                return Err(LoopError::StepLimitExceeded {
                    limit: self.config.max_steps,
                });
            }
            scope.steps += 1;
            scope.push(Message::assistant(
                result.text.clone(),
                result.tool_calls.clone(),
            ))?;

            self.transition(LoopState::ExecutingTools, observer);
            let cancelled = self.execute_tools(&mut scope, &result.tool_calls, cancel, observer)?;
            if cancelled {
                return Err(LoopError::Cancelled);
            }
            self.transition(LoopState::AwaitingModel, observer);
        }
    }

    fn call_model(
        &self,
        window: &ContextWindow,
        cancel: &CancelSignal,
        observer: &mut dyn FnMut(LoopEvent),
    ) -> Result<ChatResult, LoopError> {
        let request = ChatRequest {
            instructions: self.config.instructions.clone(),
            messages: window.messages(),
            tools: self.tools.definitions(),
        };

        let result = self
            .backend
            .complete(&request, cancel, &mut |delta| {
                observer(LoopEvent::TextDelta(delta.to_string()))
            })
            .map_err(|error| {
                if error.is_cancelled() {
                    LoopError::Cancelled
                } else {
                    LoopError::Provider(error)
                }
            })?;

        if result.is_empty() {
            return Err(LoopError::Provider(ProviderError::new(
                ProviderErrorKind::Protocol,
                self.backend.profile().provider_id,
                format!(
                    "model returned neither text nor tool calls (finish reason {:?})",
                    result.finish_reason
                ),
            )));
        }
        Ok(result)
    }

    /// Runs `calls` in order. Returns `true` when cancellation stopped the batch;
    /// skipped calls still get a failed result so the history stays paired.
    fn execute_tools(
        &self,
        scope: &mut TurnScope<'_>,
        calls: &[ToolCallRequest],
        cancel: &CancelSignal,
        observer: &mut dyn FnMut(LoopEvent),
    ) -> Result<bool, LoopError> {
        let mut cancelled = false;
        for call in calls {
            let result = if cancelled || is_cancelled(cancel) {
                cancelled = true;
                ToolResult::failure(&call.id, &call.tool_name, "Tool call skipped: turn cancelled")
            } else {
                observer(LoopEvent::ToolStarted(call.clone()));
                let execution = self.tools.execute(call, cancel);
                scope.evidence.push(ToolEvidence {
                    tool_name: call.tool_name.clone(),
                    changed_workspace: execution.changed_workspace,
                    succeeded: execution.result.succeeded,
                });
                execution.result
            };

            scope.push(Message::tool_result(&result))?;
            if !cancelled {
                observer(LoopEvent::ToolFinished(result));
            }
        }
        Ok(cancelled)
    }

    fn transition(&mut self, to: LoopState, observer: &mut dyn FnMut(LoopEvent)) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        observer(LoopEvent::StateChanged { from, to });
    }
}

fn is_cancelled(cancel: &CancelSignal) -> bool {
    cancel.load(Ordering::Acquire)
}
