use agent_provider::{Message, Role};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::turn::Turn;

pub const CONTEXT_FILE_VERSION: u32 = 2;

/// On-disk shape of one persisted window. Unknown fields are ignored and
/// every field but `turns` is optional so older files keep loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WindowFile {
    #[serde(default = "legacy_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub turns: Vec<StoredTurn>,
}

fn legacy_version() -> u32 {
    1
}

/// Version 2 stores grouped turns; version 1 stored a flat message list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum StoredTurn {
    Grouped(Turn),
    Legacy(Message),
}

impl WindowFile {
    /// Converts stored records into closed turns, regrouping flat messages at
    /// each user message.
    pub(crate) fn into_turns(self) -> Vec<Turn> {
        let mut turns: Vec<Turn> = Vec::new();
        let mut legacy: Option<Turn> = None;

        for stored in self.turns {
            match stored {
                StoredTurn::Grouped(turn) => {
                    turns.extend(legacy.take());
                    turns.push(turn);
                }
                StoredTurn::Legacy(message) if message.role == Role::User => {
                    turns.extend(legacy.take());
                    legacy = Some(legacy_turn(message));
                }
                StoredTurn::Legacy(message) => match legacy.as_mut() {
                    Some(turn) => turn.activity.push(message),
                    None => {
                        debug!("legacy context file starts without a user message");
                        let mut turn = legacy_turn(Message::user(""));
                        turn.activity.push(message);
                        legacy = Some(turn);
                    }
                },
            }
        }
        turns.extend(legacy);

        for turn in &mut turns {
            turn.close();
        }
        turns
    }
}

fn legacy_turn(request: Message) -> Turn {
    Turn {
        id: String::new(),
        started_at: String::new(),
        request,
        activity: Vec::new(),
        closed: true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn flat_messages_are_regrouped_at_user_messages() {
        let raw = json!({
            "turns": [
                {"role": "user", "content": "one"},
                {"role": "assistant", "content": "a1"},
                {"role": "user", "content": "two"},
                {"role": "assistant", "content": "a2"},
                {"role": "tool", "content": "ok", "tool_call_id": "c1"}
            ]
        });
        let file: WindowFile = serde_json::from_value(raw).expect("legacy file parses");
        assert_eq!(file.version, 1);

        let turns = file.into_turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].request.content, "one");
        assert_eq!(turns[1].activity.len(), 2);
        assert!(turns.iter().all(Turn::is_closed));
    }

    #[test]
    fn grouped_turns_are_closed_on_load() {
        let mut turn = Turn::user("hello").expect("turn");
        turn.push(Message::assistant("hi", Vec::new())).expect("push");
        let raw = json!({"version": 2, "turns": [turn], "future_field": true});

        let file: WindowFile = serde_json::from_value(raw).expect("grouped file parses");
        let turns = file.into_turns();
        assert_eq!(turns.len(), 1);
        assert!(turns[0].is_closed());
        assert_eq!(turns[0].activity[0].content, "hi");
    }
}
