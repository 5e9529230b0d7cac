//! Tool-call argument recovery.
//!
//! Some backends deliver a tool call whose top-level arguments are empty while
//! the real arguments sit on an intermediate step record or on a raw `input`
//! field. Sources are consulted in a fixed order:
//!
//! 1. the call's top-level arguments,
//! 2. step records collected for the same call id while parsing,
//! 3. the raw `input` attached to the call.
//!
//! When all three are empty the call genuinely takes no arguments.

use std::collections::HashMap;

use agent_provider::empty_arguments;
use serde_json::Value;
use tracing::debug;

/// Where the recovered arguments came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentSource {
    TopLevel,
    StepRecord,
    RawInput,
    Empty,
}

/// Argument text collected from intermediate step records, keyed by call id.
#[derive(Debug, Default, Clone)]
pub struct StepLog {
    by_call: HashMap<String, String>,
}

impl StepLog {
    /// Appends a streamed argument fragment.
    pub fn append(&mut self, call_id: &str, fragment: &str) {
        self.by_call
            .entry(call_id.to_owned())
            .or_default()
            .push_str(fragment);
    }

    /// Records the complete argument text for a call; empty text keeps earlier fragments.
    pub fn complete(&mut self, call_id: &str, arguments: &str) {
        if arguments.trim().is_empty() {
            return;
        }
        self.by_call.insert(call_id.to_owned(), arguments.to_owned());
    }

    /// Records a step whose arguments arrive as a JSON value.
    pub fn record_value(&mut self, call_id: &str, arguments: &Value) {
        if is_empty_arguments(arguments) {
            return;
        }
        let text = match arguments {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        self.by_call.insert(call_id.to_owned(), text);
    }

    pub fn get(&self, call_id: &str) -> Option<&str> {
        self.by_call.get(call_id).map(String::as_str)
    }
}

/// Applies the recovery chain and returns the arguments plus their source.
pub fn recover_arguments(
    call_id: &str,
    top_level: Option<&Value>,
    steps: &StepLog,
    raw_input: Option<&Value>,
) -> (Value, ArgumentSource) {
    if let Some(arguments) = top_level.filter(|value| !is_empty_arguments(value)) {
        return (normalize(arguments), ArgumentSource::TopLevel);
    }

    if let Some(text) = steps.get(call_id).filter(|text| !is_blank_text(text)) {
        debug!(call_id, "recovered tool arguments from step record");
        return (parse_text(text), ArgumentSource::StepRecord);
    }

    if let Some(input) = raw_input.filter(|value| !is_empty_arguments(value)) {
        debug!(call_id, "recovered tool arguments from raw input field");
        return (normalize(input), ArgumentSource::RawInput);
    }

    (empty_arguments(), ArgumentSource::Empty)
}

/// `null`, blank strings, `"{}"` and `{}` all count as "no arguments here".
pub fn is_empty_arguments(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => is_blank_text(text),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn is_blank_text(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || trimmed == "{}" || trimmed == "null"
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::String(text) => parse_text(text),
        other => other.clone(),
    }
}

/// Argument text that is not valid JSON is preserved as a string so the tool
/// executor can reject it explicitly.
fn parse_text(text: &str) -> Value {
    serde_json::from_str(text.trim()).unwrap_or_else(|_| Value::String(text.to_owned()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn top_level_arguments_win() {
        let mut steps = StepLog::default();
        steps.complete("c1", r#"{"path":"from-step"}"#);

        let (arguments, source) = recover_arguments(
            "c1",
            Some(&json!(r#"{"path":"top"}"#)),
            &steps,
            Some(&json!({"path": "input"})),
        );
        assert_eq!(arguments, json!({"path": "top"}));
        assert_eq!(source, ArgumentSource::TopLevel);
    }

    #[test]
    fn empty_top_level_falls_back_to_step_record() {
        let mut steps = StepLog::default();
        steps.append("c1", r#"{"path":"#);
        steps.append("c1", r#""a.rs"}"#);

        let (arguments, source) = recover_arguments("c1", Some(&json!("{}")), &steps, None);
        assert_eq!(arguments, json!({"path": "a.rs"}));
        assert_eq!(source, ArgumentSource::StepRecord);
    }

    #[test]
    fn step_records_for_other_calls_are_ignored() {
        let mut steps = StepLog::default();
        steps.complete("other", r#"{"path":"wrong"}"#);

        let (arguments, source) = recover_arguments(
            "c1",
            Some(&json!("")),
            &steps,
            Some(&json!(r#"{"path":"input.rs"}"#)),
        );
        assert_eq!(arguments, json!({"path": "input.rs"}));
        assert_eq!(source, ArgumentSource::RawInput);
    }

    #[test]
    fn all_sources_empty_is_a_genuine_empty_object() {
        let (arguments, source) =
            recover_arguments("c1", Some(&json!({})), &StepLog::default(), Some(&Value::Null));
        assert_eq!(arguments, json!({}));
        assert_eq!(source, ArgumentSource::Empty);
    }

    #[test]
    fn malformed_argument_text_is_preserved_as_string() {
        let (arguments, _) =
            recover_arguments("c1", Some(&json!("{not json")), &StepLog::default(), None);
        assert_eq!(arguments, json!("{not json"));
    }

    #[test]
    fn blank_completion_keeps_streamed_fragments() {
        let mut steps = StepLog::default();
        steps.append("c1", r#"{"a":1}"#);
        steps.complete("c1", "");
        assert_eq!(steps.get("c1"), Some(r#"{"a":1}"#));
    }
}
