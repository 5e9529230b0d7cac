//! Minimal provider-agnostic contract for one model round trip.
//!
//! This crate defines the message history, host-mediated tool-calling types and
//! the normalized result every wire variant is parsed into. It excludes
//! transport details, protocol payloads and loop orchestration.

use std::fmt;
use std::sync::{atomic::AtomicBool, Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Shared cancellation flag observed at every suspension point.
pub type CancelSignal = Arc<AtomicBool>;

/// Creates a fresh, un-triggered cancellation flag.
#[must_use]
pub fn cancel_signal() -> CancelSignal {
    Arc::new(AtomicBool::new(false))
}

/// Author of one history message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    /// Loop-authored guidance (corrective retries, subagent framing).
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

/// One model-facing history item. Immutable once appended to a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Builds the tool-role message carrying one tool result back to the model.
    #[must_use]
    pub fn tool_result(result: &ToolResult) -> Self {
        Self {
            role: Role::Tool,
            content: result.output.clone(),
            tool_calls: Vec::new(),
            tool_call_id: Some(result.tool_call_id.clone()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Rough serialized footprint used for window budgeting.
    pub fn estimated_bytes(&self) -> usize {
        let calls: usize = self
            .tool_calls
            .iter()
            .map(|call| call.id.len() + call.tool_name.len() + call.arguments.to_string().len())
            .sum();
        self.content.len() + calls + self.tool_call_id.as_ref().map_or(0, String::len)
    }
}

/// Provider request envelope for one host tool call.
///
/// `arguments` is always a JSON value; an empty object is a legitimate
/// zero-argument call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub tool_name: String,
    #[serde(default = "empty_arguments")]
    pub arguments: Value,
}

impl ToolCallRequest {
    #[must_use]
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// Canonical empty-argument value.
#[must_use]
pub fn empty_arguments() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Host tool call result returned back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub output: String,
    pub succeeded: bool,
}

impl ToolResult {
    #[must_use]
    pub fn success(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            output: output.into(),
            succeeded: true,
        }
    }

    #[must_use]
    pub fn failure(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            output: output.into(),
            succeeded: false,
        }
    }
}

/// Generic host-mediated tool definition exposed to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Input for one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub instructions: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn parse(value: &str) -> Self {
        match value {
            "stop" | "completed" | "end_turn" => Self::Stop,
            "tool_calls" | "function_call" | "tool_use" => Self::ToolCalls,
            "length" | "max_tokens" | "max_output_tokens" => Self::Length,
            "content_filter" => Self::ContentFilter,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Normalized model output, identical across wire variants.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatResult {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: FinishReason,
}

impl ChatResult {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
        }
    }

    #[must_use]
    pub fn tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            text: text.into(),
            tool_calls,
            finish_reason: FinishReason::ToolCalls,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.tool_calls.is_empty()
    }
}

/// Immutable metadata describing the backend serving a loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub provider_id: String,
    pub model_id: String,
}

/// Failure classes surfaced by a backend after its own retry policy ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Transport,
    RateLimited,
    Auth,
    Protocol,
    Cancelled,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport error",
            Self::RateLimited => "rate limited",
            Self::Auth => "authentication error",
            Self::Protocol => "protocol error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Backend failure with enough context to reproduce it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub provider_id: String,
    pub message: String,
}

impl ProviderError {
    #[must_use]
    pub fn new(
        kind: ProviderErrorKind,
        provider_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            provider_id: provider_id.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn cancelled(provider_id: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Cancelled, provider_id, "request was cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ProviderErrorKind::Cancelled
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.kind.as_str(),
            self.provider_id,
            self.message
        )
    }
}

impl std::error::Error for ProviderError {}

/// Capability the model loop drives once per `AwaitingModel` state.
///
/// Implementations block for the full network round trip (or streaming
/// lifetime) and must return `ProviderErrorKind::Cancelled` promptly once
/// `cancel` is set.
pub trait ChatBackend: Send + Sync + 'static {
    fn profile(&self) -> ProviderProfile;

    /// Executes one model call. `on_text` receives streamed text deltas in order.
    fn complete(
        &self,
        request: &ChatRequest,
        cancel: &CancelSignal,
        on_text: &mut dyn FnMut(&str),
    ) -> Result<ChatResult, ProviderError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn finish_reason_parses_variant_spellings() {
        assert_eq!(FinishReason::parse("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::parse("completed"), FinishReason::Stop);
        assert_eq!(FinishReason::parse("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::parse("max_output_tokens"), FinishReason::Length);
        assert_eq!(
            FinishReason::parse("weird"),
            FinishReason::Other("weird".to_string())
        );
    }

    #[test]
    fn tool_result_message_links_call_id() {
        let result = ToolResult::success("call-1", "write_file", "Wrote a.rs");
        let message = Message::tool_result(&result);

        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(message.content, "Wrote a.rs");
    }

    #[test]
    fn message_deserializes_with_missing_optional_fields() {
        let message: Message =
            serde_json::from_value(json!({"role": "assistant"})).expect("message should parse");

        assert_eq!(message.role, Role::Assistant);
        assert!(message.content.is_empty());
        assert!(message.tool_calls.is_empty());
        assert!(message.tool_call_id.is_none());
    }

    #[test]
    fn tool_call_arguments_default_to_empty_object() {
        let call: ToolCallRequest =
            serde_json::from_value(json!({"id": "c", "tool_name": "status"}))
                .expect("call should parse");
        assert_eq!(call.arguments, json!({}));
    }

    #[test]
    fn provider_error_display_names_kind_and_provider() {
        let error = ProviderError::new(ProviderErrorKind::Protocol, "zai", "missing choices");
        assert_eq!(error.to_string(), "protocol error (zai): missing choices");
        assert!(!error.is_cancelled());
        assert!(ProviderError::cancelled("zai").is_cancelled());
    }

    #[test]
    fn estimated_bytes_counts_content_and_calls() {
        let message = Message::assistant(
            "abcd",
            vec![ToolCallRequest::new("id", "bash", json!({"command": "ls"}))],
        );
        assert!(message.estimated_bytes() > 4);
        assert_eq!(Message::user("hello").estimated_bytes(), 5);
    }

    #[test]
    fn empty_chat_result_detection_ignores_whitespace() {
        assert!(ChatResult::text("  \n").is_empty());
        assert!(!ChatResult::text("done").is_empty());
    }
}
