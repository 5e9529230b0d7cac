use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use agent_provider::{Message, Role, ToolCallRequest, ToolResult};
use context_window::{
    context_file_path, context_root, list_sessions, ContextWindow, Turn, CONTEXT_FILE_VERSION,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;

fn tool_turn(request: &str) -> Turn {
    let mut turn = Turn::user(request).expect("turn should be created");
    let call = ToolCallRequest::new("call_1", "write_file", json!({"path": "a.rs", "content": "fn x() {}"}));
    turn.push(Message::assistant("", vec![call]))
        .expect("assistant message should be appended");
    turn.push(Message::tool_result(&ToolResult::success("call_1", "write_file", "wrote a.rs")))
        .expect("tool message should be appended");
    turn.push(Message::assistant("Done, function x added", Vec::new()))
        .expect("final message should be appended");
    turn.close();
    turn
}

fn window_path(dir: &TempDir) -> PathBuf {
    dir.path().join("context-0123456789abcdef.json")
}

#[test]
fn save_then_load_reproduces_turns_in_order() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = window_path(&dir);

    let mut window = ContextWindow::new();
    window.append(tool_turn("add function x")).expect("append");
    window.append(tool_turn("add function y")).expect("append");
    window.save(&path).expect("window should save");

    let restored = ContextWindow::load(&path);
    assert_eq!(restored.turns(), window.turns());
    assert_eq!(restored.title(), Some("add function x"));

    let raw: Value =
        serde_json::from_str(&fs::read_to_string(&path).expect("file should be readable"))
            .expect("file should be json");
    assert_eq!(raw["version"], json!(CONTEXT_FILE_VERSION));
    assert!(raw["updated_at"].is_string());
}

#[test]
fn missing_or_corrupt_file_loads_empty() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let missing = dir.path().join("context-missing.json");
    assert!(ContextWindow::load(&missing).is_empty());

    let corrupt = dir.path().join("context-corrupt.json");
    fs::write(&corrupt, "{\"turns\": [").expect("corrupt file should be written");
    let window = ContextWindow::load(&corrupt);
    assert!(window.is_empty());
    assert_eq!(window.title(), None);
}

#[test]
fn legacy_flat_file_is_regrouped() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("context-legacy.json");
    let legacy = json!({
        "title": "",
        "turns": [
            {"role": "user", "content": "fix the parser"},
            {"role": "assistant", "content": "on it"},
            {"role": "user", "content": "and the lexer"}
        ],
        "unknown": {"nested": 1}
    });
    fs::write(&path, legacy.to_string()).expect("legacy file should be written");

    let window = ContextWindow::load(&path);
    assert_eq!(window.len(), 2);
    assert_eq!(window.title(), Some("fix the parser"));
    assert_eq!(window.turns()[0].activity[0].role, Role::Assistant);
    assert!(window.turns().iter().all(Turn::is_closed));
}

#[test]
fn open_binds_window_to_project_file_and_persists_appends() {
    let config = tempfile::tempdir().expect("tempdir should be created");
    let project = tempfile::tempdir().expect("project dir should be created");
    let contexts = context_root(config.path());

    let mut window = ContextWindow::open(&contexts, project.path());
    assert!(window.is_empty());
    window
        .begin_turn(Message::user("refactor module"))
        .expect("turn should begin");
    window
        .push_message(Message::assistant("partial", Vec::new()))
        .expect("message should be pushed");
    window.flush().expect("flush should persist");

    let expected = context_file_path(&contexts, project.path());
    assert_eq!(window.path(), Some(expected.as_path()));
    assert_eq!(expected.parent(), Some(config.path()));

    let reopened = ContextWindow::open(&contexts, project.path());
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened.messages().len(), 2);
    assert!(reopened.turns()[0].is_closed());
    assert_eq!(reopened.project_path(), Some(project.path()));
}

#[test]
fn clear_removes_persisted_file() {
    let config = tempfile::tempdir().expect("tempdir should be created");
    let project = tempfile::tempdir().expect("project dir should be created");
    let mut window = ContextWindow::open(config.path(), project.path());
    window.append(tool_turn("task")).expect("append");
    let path = window.path().expect("window is bound").to_path_buf();
    assert!(path.exists());

    window.clear().expect("clear should succeed");
    assert!(window.is_empty());
    assert!(!path.exists());
    window.clear().expect("clearing twice is fine");
}

#[test]
fn concurrent_saves_never_leave_partial_files() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = Arc::new(window_path(&dir));

    let writers: Vec<_> = (0..4)
        .map(|writer| {
            let path = Arc::clone(&path);
            thread::spawn(move || {
                for round in 0..10 {
                    let mut window = ContextWindow::new();
                    for index in 0..=round {
                        window
                            .append(tool_turn(&format!("writer {writer} turn {index}")))
                            .expect("append");
                    }
                    window.save(&path).expect("save should succeed");
                }
            })
        })
        .collect();
    let reader = {
        let path = Arc::clone(&path);
        thread::spawn(move || {
            for _ in 0..40 {
                if path.exists() {
                    let raw = fs::read_to_string(path.as_ref()).expect("read");
                    serde_json::from_str::<Value>(&raw).expect("never a partial file");
                }
            }
        })
    };

    for writer in writers {
        writer.join().expect("writer thread");
    }
    reader.join().expect("reader thread");
    assert!(!ContextWindow::load(&path).is_empty());
}

#[test]
fn list_sessions_orders_most_recent_first() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let older = dir.path().join("context-aaaaaaaaaaaaaaaa.json");
    let newer = dir.path().join("context-bbbbbbbbbbbbbbbb.json");

    let mut first = ContextWindow::new();
    first.append(tool_turn("older task")).expect("append");
    first.save(&older).expect("save");
    set_modified(&older, 1_000);

    let mut second = ContextWindow::new();
    second.append(tool_turn("newer task")).expect("append");
    second.append(tool_turn("follow up")).expect("append");
    second.save(&newer).expect("save");
    set_modified(&newer, 2_000);

    fs::write(dir.path().join("settings.json"), "{}").expect("unrelated file");

    let sessions = list_sessions(dir.path()).expect("listing should succeed");
    let ids: Vec<_> = sessions.iter().map(|session| session.id.as_str()).collect();
    assert_eq!(ids, vec!["bbbbbbbbbbbbbbbb", "aaaaaaaaaaaaaaaa"]);
    assert_eq!(sessions[0].title.as_deref(), Some("newer task"));
    assert_eq!(sessions[0].turn_count, 2);
    assert!(sessions[0].size_bytes > 0);
}

#[test]
fn list_sessions_on_missing_dir_is_empty() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let sessions = list_sessions(&dir.path().join("nope")).expect("listing should succeed");
    assert!(sessions.is_empty());
}

fn set_modified(path: &Path, seconds: u64) {
    let file = fs::File::options()
        .write(true)
        .open(path)
        .expect("file should open");
    file.set_modified(std::time::UNIX_EPOCH + std::time::Duration::from_secs(seconds))
        .expect("mtime should be set");
}
