//! Line-oriented session driver.
//!
//! Each input line is either a slash command or one user task. Tasks run to
//! completion through the model loop before the next line is read; streamed
//! assistant text goes to the output as it arrives.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent_provider::{cancel_signal, CancelSignal, ChatBackend};
use coding_agent::commands::{parse_slash_command, SlashCommand, HELP_TEXT};
use coding_agent::{
    DelegateTool, LoopConfig, LoopEvent, ModelLoop, StatusSink, SubagentSupervisor, ToolExecutor,
    ToolRegistry, Workspace,
};
use context_window::{list_sessions, ContextWindow};
use tracing::{debug, warn};

use crate::providers::Providers;

/// Whether the driver should keep reading input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub workspace_root: PathBuf,
    pub contexts_dir: PathBuf,
    pub loop_config: LoopConfig,
    pub window_budget_bytes: usize,
}

pub struct Session<W: Write> {
    providers: Providers,
    model_loop: ModelLoop,
    window: ContextWindow,
    workspace: Workspace,
    status: StatusSink,
    contexts_dir: PathBuf,
    cancel: CancelSignal,
    out: W,
}

impl<W: Write> Session<W> {
    /// Opens the project's persisted window and binds `backend` to the loop.
    pub fn new(
        options: SessionOptions,
        providers: Providers,
        backend: Arc<dyn ChatBackend>,
        out: W,
    ) -> io::Result<Self> {
        let workspace = Workspace::new(&options.workspace_root).map_err(io::Error::other)?;
        let status = StatusSink::new();
        let window = ContextWindow::open(&options.contexts_dir, workspace.root())
            .with_budget(options.window_budget_bytes);
        debug!(turns = window.len(), path = ?window.path(), "context window restored");

        let tools = build_tools(Arc::clone(&backend), &workspace, &status);
        let model_loop = ModelLoop::new(backend, tools, options.loop_config);

        Ok(Self {
            providers,
            model_loop,
            window,
            workspace,
            status,
            contexts_dir: options.contexts_dir,
            cancel: cancel_signal(),
            out,
        })
    }

    /// Window for the current workspace.
    pub fn window(&self) -> &ContextWindow {
        &self.window
    }

    pub fn status(&self) -> &StatusSink {
        &self.status
    }

    /// Cancellation flag for the turn in flight.
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Consumes the session and returns its writer.
    pub fn into_output(self) -> W {
        self.out
    }

    /// Reads lines until end of input or `/quit`.
    pub fn run(&mut self, input: impl BufRead) -> io::Result<()> {
        for line in input.lines() {
            if self.handle_line(&line?)? == Flow::Quit {
                break;
            }
        }
        self.out.flush()
    }

    /// Runs one input line as a slash command or a task.
    pub fn handle_line(&mut self, line: &str) -> io::Result<Flow> {
        if line.trim().is_empty() {
            return Ok(Flow::Continue);
        }

        match parse_slash_command(line) {
            Some(command) => self.handle_command(command),
            None => {
                self.run_task(&unescape_newlines(line.trim()))?;
                Ok(Flow::Continue)
            }
        }
    }

    fn handle_command(&mut self, command: SlashCommand) -> io::Result<Flow> {
        match command {
            SlashCommand::Help => writeln!(self.out, "{HELP_TEXT}")?,
            SlashCommand::Model(None) => {
                let profile = self.model_loop.profile();
                writeln!(self.out, "Model: {}/{}", profile.provider_id, profile.model_id)?;
            }
            SlashCommand::Model(Some(reference)) => match self.providers.select_ref(&reference) {
                Ok(backend) => {
                    let tools = build_tools(Arc::clone(&backend), &self.workspace, &self.status);
                    self.model_loop.replace_backend(backend, tools);
                    let profile = self.model_loop.profile();
                    writeln!(
                        self.out,
                        "Switched to {}/{}",
                        profile.provider_id, profile.model_id
                    )?;
                }
                Err(error) => writeln!(self.out, "error: {error}")?,
            },
            SlashCommand::Clear => {
                self.status.clear();
                match self.window.clear() {
                    Ok(()) => writeln!(self.out, "Context cleared.")?,
                    Err(error) => writeln!(self.out, "error: {error}")?,
                }
            }
            SlashCommand::Sessions => self.write_sessions()?,
            SlashCommand::Status => self.write_status()?,
            SlashCommand::Quit => return Ok(Flow::Quit),
            SlashCommand::Unknown(command) => writeln!(
                self.out,
                "Unknown command: {command}. Type /help for the list of commands."
            )?,
        }
        Ok(Flow::Continue)
    }

    fn run_task(&mut self, task: &str) -> io::Result<()> {
        let out = &mut self.out;
        let mut write_error: Option<io::Error> = None;
        let mut streamed = false;
        let mut observer = |event: LoopEvent| {
            let written = match event {
                LoopEvent::TextDelta(delta) => {
                    streamed = true;
                    write!(out, "{delta}").and_then(|()| out.flush())
                }
                LoopEvent::ToolStarted(call) => {
                    let prefix = if streamed { "\n" } else { "" };
                    streamed = false;
                    writeln!(out, "{prefix}[tool] {}", call.tool_name)
                }
                LoopEvent::CorrectiveRetry { attempt, reason } => {
                    let prefix = if streamed { "\n" } else { "" };
                    streamed = false;
                    writeln!(out, "{prefix}[retry {attempt}] {reason}")
                }
                LoopEvent::StateChanged { .. }
                | LoopEvent::ToolFinished(_)
                | LoopEvent::Finished(_) => Ok(()),
            };
            if let Err(error) = written {
                write_error.get_or_insert(error);
            }
        };

        let result = self
            .model_loop
            .run_turn(&mut self.window, task, &self.cancel, &mut observer);
        let ends_mid_line = streamed;
        if let Some(error) = write_error {
            return Err(error);
        }
        if ends_mid_line {
            writeln!(self.out)?;
        }

        if let Err(error) = result {
            writeln!(self.out, "error: {error}")?;
            if error.is_cancelled() {
                self.cancel = cancel_signal();
            }
        }
        if let Err(error) = self.window.flush() {
            warn!(%error, "failed to save context window");
        }
        self.out.flush()
    }

    fn write_sessions(&mut self) -> io::Result<()> {
        let sessions = match list_sessions(&self.contexts_dir) {
            Ok(sessions) => sessions,
            Err(error) => return writeln!(self.out, "error: {error}"),
        };
        if sessions.is_empty() {
            return writeln!(self.out, "No saved sessions.");
        }

        let current = self.window.path().map(Path::to_path_buf);
        for session in sessions {
            let marker = if current.as_deref() == Some(session.path.as_path()) {
                "*"
            } else {
                " "
            };
            let label = session
                .title
                .as_deref()
                .or_else(|| session.project_path.as_deref().and_then(Path::to_str))
                .unwrap_or("(untitled)");
            writeln!(
                self.out,
                "{marker} {}  {} turns  {label}",
                session.id, session.turn_count
            )?;
        }
        Ok(())
    }

    fn write_status(&mut self) -> io::Result<()> {
        let profile = self.model_loop.profile();
        writeln!(self.out, "Model: {}/{}", profile.provider_id, profile.model_id)?;
        writeln!(self.out, "Workspace: {}", self.workspace.root().display())?;
        writeln!(
            self.out,
            "Context: {} turns, {} bytes",
            self.window.len(),
            self.window.total_bytes()
        )?;
        match self.status.current() {
            Some(status) => writeln!(self.out, "Status: {status}"),
            None => writeln!(self.out, "Status: (none)"),
        }
    }
}

/// Built-in tools plus `delegate`, whose subagents share `backend` and use the
/// built-ins without further delegation.
fn build_tools(
    backend: Arc<dyn ChatBackend>,
    workspace: &Workspace,
    status: &StatusSink,
) -> Arc<dyn ToolExecutor> {
    let worker_tools = ToolRegistry::builtin(workspace.clone(), status.clone());
    let supervisor = Arc::new(SubagentSupervisor::new(
        backend,
        Arc::new(worker_tools.clone()),
    ));
    Arc::new(worker_tools.with_tool(DelegateTool::new(supervisor)))
}

/// Turns literal `\n` sequences into newlines so one input line can carry a
/// multi-line task. `\\n` stays a literal backslash followed by `n`.
pub fn unescape_newlines(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some('n') => {
                chars.next();
                out.push('\n');
            }
            Some('\\') => {
                chars.next();
                out.push('\\');
            }
            _ => out.push('\\'),
        }
    }
    out
}
