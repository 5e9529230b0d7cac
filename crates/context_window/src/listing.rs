use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::error::ContextWindowError;
use crate::paths::session_id_from_file_name;
use crate::window::ContextWindow;

/// Metadata for one persisted window, for resume pickers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size_bytes: u64,
    pub title: Option<String>,
    pub project_path: Option<PathBuf>,
    pub turn_count: usize,
}

/// Lists persisted windows under `dir`, most recently modified first.
///
/// A missing directory lists as empty. Files that are not context files are
/// skipped.
pub fn list_sessions(dir: &Path) -> Result<Vec<SessionSummary>, ContextWindowError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ContextWindowError::io(
                "listing context directory",
                dir,
                source,
            ))
        }
    };

    let mut sessions = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|source| ContextWindowError::io("reading context directory", dir, source))?;
        let path = entry.path();
        let Some(id) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(session_id_from_file_name)
            .map(ToString::to_string)
        else {
            continue;
        };

        let metadata = match entry.metadata() {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(error) => {
                debug!(path = %path.display(), %error, "skipping unreadable context file");
                continue;
            }
        };

        let window = ContextWindow::load(&path);
        sessions.push(SessionSummary {
            id,
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size_bytes: metadata.len(),
            title: window.title().map(ToString::to_string),
            project_path: window.project_path().map(Path::to_path_buf),
            turn_count: window.len(),
            path,
        });
    }

    sessions.sort_by(|left, right| {
        right
            .modified
            .cmp(&left.modified)
            .then_with(|| left.id.cmp(&right.id))
    });
    Ok(sessions)
}
