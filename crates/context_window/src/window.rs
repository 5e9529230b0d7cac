use std::path::{Path, PathBuf};

use agent_provider::{Message, Role};
use tracing::{debug, warn};

use crate::error::ContextWindowError;
use crate::paths::context_file_path;
use crate::schema::{StoredTurn, WindowFile, CONTEXT_FILE_VERSION};
use crate::store::{read_locked, remove_locked, write_atomic};
use crate::turn::{now_rfc3339, Turn};

pub const TITLE_MAX_CHARS: usize = 80;

/// Ordered, size-bounded turn history for one project.
///
/// The window is single-writer: the owning loop appends, and persistence is
/// keyed by project identity when the window is bound to a file.
#[derive(Debug, Clone, Default)]
pub struct ContextWindow {
    turns: Vec<Turn>,
    budget_bytes: Option<usize>,
    title: Option<String>,
    project_path: Option<PathBuf>,
    path: Option<PathBuf>,
}

impl ContextWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the estimated history size; [`ContextWindow::append`] evicts
    /// oldest turns past it.
    #[must_use]
    pub fn with_budget(mut self, budget_bytes: usize) -> Self {
        self.budget_bytes = Some(budget_bytes);
        self
    }

    /// Binds the window to `path`; later appends and closes persist there.
    #[must_use]
    pub fn bound_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Restores the window persisted for `project_path` under `dir`, or an
    /// empty one, and binds it to that file.
    pub fn open(dir: &Path, project_path: &Path) -> Self {
        let path = context_file_path(dir, project_path);
        let mut window = Self::load(&path).bound_to(path);
        if window.project_path.is_none() {
            window.project_path = Some(project_path.to_path_buf());
        }
        window
    }

    /// File the window persists to, once bound to a project.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Session title, taken from the first request unless set explicitly.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = Some(truncate_title(&title.into()));
    }

    /// Project directory the window belongs to.
    pub fn project_path(&self) -> Option<&Path> {
        self.project_path.as_deref()
    }

    pub fn budget_bytes(&self) -> Option<usize> {
        self.budget_bytes
    }

    /// Turns in conversation order, oldest first.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Number of turns, including an open one.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Estimated serialized size of all turns.
    pub fn total_bytes(&self) -> usize {
        self.turns.iter().map(Turn::estimated_bytes).sum()
    }

    /// The open turn, if one is in progress.
    pub fn current_turn(&self) -> Option<&Turn> {
        self.turns.last().filter(|turn| !turn.is_closed())
    }

    /// Flattened model-facing history, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.turns
            .iter()
            .flat_map(|turn| turn.messages().cloned())
            .collect()
    }

    /// Adds `turn` as the newest entry, closing any turn still in progress.
    ///
    /// The in-memory window is updated before anything touches disk, so a
    /// persistence error leaves the turn appended.
    pub fn append(&mut self, turn: Turn) -> Result<(), ContextWindowError> {
        if let Some(previous) = self.turns.last_mut() {
            previous.close();
        }
        if self.title.is_none() && turn.request.role == Role::User {
            let request = turn.request.content.trim();
            if !request.is_empty() {
                self.title = Some(truncate_title(request));
            }
        }
        self.turns.push(turn);
        self.enforce_budget();
        self.persist()
    }

    /// Opens a new turn for `request` and returns its id.
    pub fn begin_turn(&mut self, request: Message) -> Result<String, ContextWindowError> {
        let turn = Turn::new(request)?;
        let id = turn.id.clone();
        self.append(turn)?;
        Ok(id)
    }

    /// Appends one message to the in-progress turn. Memory only; call
    /// [`ContextWindow::flush`] or close the turn to persist.
    pub fn push_message(&mut self, message: Message) -> Result<(), ContextWindowError> {
        match self.turns.last_mut() {
            Some(turn) if !turn.is_closed() => turn.push(message),
            _ => Err(ContextWindowError::NoOpenTurn),
        }
    }

    /// Closes the in-progress turn and persists the window.
    pub fn close_current_turn(&mut self) -> Result<(), ContextWindowError> {
        match self.turns.last_mut() {
            Some(turn) if !turn.is_closed() => turn.close(),
            _ => return Err(ContextWindowError::NoOpenTurn),
        }
        self.enforce_budget();
        self.persist()
    }

    /// Evicts oldest turns while the estimated size exceeds `budget_bytes`.
    ///
    /// The newest turn is never evicted and retained turns keep their order.
    /// Returns the number of evicted turns.
    pub fn trim(&mut self, budget_bytes: usize) -> usize {
        let mut total = self.total_bytes();
        let mut evict = 0;
        while total > budget_bytes && self.turns.len() - evict > 1 {
            total -= self.turns[evict].estimated_bytes();
            evict += 1;
        }
        if evict > 0 {
            self.turns.drain(..evict);
            debug!(evicted = evict, remaining = self.turns.len(), "trimmed context window");
        }
        evict
    }

    /// Applies the configured budget, if any.
    pub fn enforce_budget(&mut self) -> usize {
        match self.budget_bytes {
            Some(budget) => self.trim(budget),
            None => 0,
        }
    }

    /// Writes the window to its bound file, if any.
    pub fn flush(&self) -> Result<(), ContextWindowError> {
        self.persist()
    }

    /// Drops all turns and removes the bound file.
    pub fn clear(&mut self) -> Result<(), ContextWindowError> {
        self.turns.clear();
        self.title = None;
        match &self.path {
            Some(path) => remove_locked(path),
            None => Ok(()),
        }
    }

    /// Writes the window to `path` atomically through a temp file.
    pub fn save(&self, path: &Path) -> Result<(), ContextWindowError> {
        let file = WindowFile {
            version: CONTEXT_FILE_VERSION,
            title: self.title.clone(),
            project_path: self
                .project_path
                .as_ref()
                .map(|path| path.display().to_string()),
            updated_at: Some(now_rfc3339()?),
            turns: self.turns.iter().cloned().map(StoredTurn::Grouped).collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|source| ContextWindowError::json_serialize(path, source))?;
        write_atomic(path, &bytes)
    }

    /// Loads the window stored at `path`.
    ///
    /// A missing file yields an empty window. An unreadable or corrupt file is
    /// logged and also yields an empty window.
    pub fn load(path: &Path) -> Self {
        let bytes = match read_locked(path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Self::default(),
            Err(error) => {
                warn!(path = %path.display(), %error, "context file unreadable; starting empty");
                return Self::default();
            }
        };

        let file: WindowFile = match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(error) => {
                warn!(path = %path.display(), %error, "context file corrupt; starting empty");
                return Self::default();
            }
        };

        let title = file.title.clone().filter(|title| !title.trim().is_empty());
        let project_path = file.project_path.clone().map(PathBuf::from);
        let turns = file.into_turns();
        let title = title.or_else(|| {
            turns
                .iter()
                .map(|turn| turn.request.content.trim())
                .find(|request| !request.is_empty())
                .map(truncate_title)
        });

        Self {
            turns,
            budget_bytes: None,
            title,
            project_path,
            path: None,
        }
    }

    fn persist(&self) -> Result<(), ContextWindowError> {
        match &self.path {
            Some(path) => self.save(path),
            None => Ok(()),
        }
    }
}

fn truncate_title(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    let mut title: String = line.chars().take(TITLE_MAX_CHARS - 3).collect();
    title.push_str("...");
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_turn(request: &str, reply: &str) -> Turn {
        let mut turn = Turn::user(request).expect("turn");
        turn.push(Message::assistant(reply, Vec::new())).expect("push");
        turn.close();
        turn
    }

    #[test]
    fn trim_evicts_oldest_first_and_keeps_order() {
        let mut window = ContextWindow::new();
        for index in 0..4 {
            window
                .append(closed_turn(&format!("request {index}"), &"x".repeat(100)))
                .expect("append");
        }
        let per_turn = window.turns()[0].estimated_bytes();

        let evicted = window.trim(per_turn * 2);

        assert_eq!(evicted, 2);
        let requests: Vec<_> = window
            .turns()
            .iter()
            .map(|turn| turn.request.content.as_str())
            .collect();
        assert_eq!(requests, vec!["request 2", "request 3"]);
    }

    #[test]
    fn trim_never_drops_the_last_turn() {
        let mut window = ContextWindow::new();
        window
            .append(closed_turn("old", "small"))
            .expect("append");
        window
            .begin_turn(Message::user("y".repeat(10_000)))
            .expect("begin");

        let evicted = window.trim(10);

        assert_eq!(evicted, 1);
        assert_eq!(window.len(), 1);
        assert!(window.current_turn().is_some());
        assert!(window.total_bytes() > 10);
    }

    #[test]
    fn append_closes_previous_turn_and_sets_title() {
        let mut window = ContextWindow::new();
        window
            .begin_turn(Message::user("first request"))
            .expect("begin");
        window
            .begin_turn(Message::user("second request"))
            .expect("begin");

        assert!(window.turns()[0].is_closed());
        assert!(!window.turns()[1].is_closed());
        assert_eq!(window.title(), Some("first request"));
    }

    #[test]
    fn push_message_requires_open_turn() {
        let mut window = ContextWindow::new();
        assert!(matches!(
            window.push_message(Message::assistant("hi", Vec::new())),
            Err(ContextWindowError::NoOpenTurn)
        ));

        window.begin_turn(Message::user("go")).expect("begin");
        window
            .push_message(Message::assistant("hi", Vec::new()))
            .expect("push");
        window.close_current_turn().expect("close");
        assert!(matches!(
            window.close_current_turn(),
            Err(ContextWindowError::NoOpenTurn)
        ));
        assert_eq!(window.messages().len(), 2);
    }

    #[test]
    fn configured_budget_applies_on_append() {
        let mut window = ContextWindow::new().with_budget(50);
        window
            .append(closed_turn("a", &"x".repeat(60)))
            .expect("append");
        window
            .append(closed_turn("b", &"x".repeat(60)))
            .expect("append");
        assert_eq!(window.len(), 1);
        assert_eq!(window.turns()[0].request.content, "b");
    }

    #[test]
    fn long_titles_are_truncated() {
        let title = truncate_title(&"a".repeat(200));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS);
        assert!(title.ends_with("..."));
        assert_eq!(truncate_title("line one\nline two"), "line one");
    }
}
