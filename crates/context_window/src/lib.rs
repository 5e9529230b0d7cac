//! Ordered, size-bounded conversation history persisted per project.
//!
//! A [`ContextWindow`] holds [`Turn`]s: one user request plus the
//! assistant/tool messages produced while servicing it. Windows are saved
//! atomically to `context-<hash>.json`, where the hash identifies the project
//! directory, and load forgivingly: missing or corrupt files give an empty
//! window.

pub mod error;
pub mod listing;
pub mod paths;
mod schema;
mod store;
pub mod turn;
pub mod window;

pub use error::ContextWindowError;
pub use listing::{list_sessions, SessionSummary};
pub use paths::{context_file_name, context_file_path, context_root, project_hash};
pub use schema::CONTEXT_FILE_VERSION;
pub use turn::Turn;
pub use window::{ContextWindow, TITLE_MAX_CHARS};
