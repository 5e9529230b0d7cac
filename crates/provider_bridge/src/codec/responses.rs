use std::collections::HashMap;

use agent_provider::{
    ChatRequest, ChatResult, FinishReason, Message, Role, ToolCallRequest, ToolDefinition,
};
use provider_registry::WireVariant;
use serde_json::{json, Value};
use tracing::debug;

use super::{tool_arguments_text, ResponseDecoder, WireCodec};
use crate::error::BridgeError;
use crate::events::{map_event, ResponseStatus, StreamEvent};
use crate::recovery::{is_empty_arguments, recover_arguments, StepLog};
use crate::sse::SseDecoder;

/// Streaming `/responses` with API-key auth.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponsesCodec;

/// `/codex/responses` behind an OAuth account token. Same stream grammar as
/// [`ResponsesCodec`]; the request carries the stateless transport defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct OauthResponsesCodec;

impl WireCodec for ResponsesCodec {
    fn variant(&self) -> WireVariant {
        WireVariant::Responses
    }

    fn build_request(&self, model: &str, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": model,
            "input": encode_input(&request.messages, "system"),
            "stream": true,
        });
        if !request.instructions.trim().is_empty() {
            body["instructions"] = Value::String(request.instructions.clone());
        }
        attach_tools(&mut body, &request.tools);
        body
    }

    fn decoder(&self) -> Box<dyn ResponseDecoder> {
        Box::new(ResponsesDecoder::default())
    }
}

impl WireCodec for OauthResponsesCodec {
    fn variant(&self) -> WireVariant {
        WireVariant::OauthResponses
    }

    fn build_request(&self, model: &str, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": model,
            "instructions": request.instructions,
            "input": encode_input(&request.messages, "developer"),
            "stream": true,
            "store": false,
            "text": {"verbosity": "medium"},
            "include": ["reasoning.encrypted_content"],
            "parallel_tool_calls": false,
        });
        attach_tools(&mut body, &request.tools);
        body
    }

    fn decoder(&self) -> Box<dyn ResponseDecoder> {
        Box::new(ResponsesDecoder::default())
    }
}

fn attach_tools(body: &mut Value, tools: &[ToolDefinition]) {
    if tools.is_empty() {
        return;
    }
    body["tools"] = Value::Array(tools.iter().map(encode_tool).collect());
    body["tool_choice"] = Value::String("auto".to_string());
}

fn encode_tool(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.input_schema,
        "strict": false,
    })
}

fn encode_input(messages: &[Message], system_role: &str) -> Vec<Value> {
    let mut input = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::User => input.push(text_item("user", "input_text", &message.content)),
            Role::System => input.push(text_item(system_role, "input_text", &message.content)),
            Role::Assistant => {
                if !message.content.is_empty() {
                    input.push(text_item("assistant", "output_text", &message.content));
                }
                input.extend(message.tool_calls.iter().map(|call| {
                    json!({
                        "type": "function_call",
                        "call_id": call.id,
                        "name": call.tool_name,
                        "arguments": tool_arguments_text(&call.arguments),
                    })
                }));
            }
            Role::Tool => input.push(json!({
                "type": "function_call_output",
                "call_id": message.tool_call_id.as_deref().unwrap_or_default(),
                "output": message.content,
            })),
        }
    }
    input
}

fn text_item(role: &str, part_type: &str, text: &str) -> Value {
    json!({
        "role": role,
        "content": [{"type": part_type, "text": text}],
    })
}

#[derive(Debug)]
struct PendingCall {
    call_id: String,
    name: String,
    top_level: Option<Value>,
    raw_input: Option<Value>,
}

/// Accumulates text and tool calls from a responses event stream.
#[derive(Debug, Default)]
struct ResponsesDecoder {
    sse: SseDecoder,
    saw_frame: bool,
    text: String,
    calls: Vec<PendingCall>,
    item_to_call: HashMap<String, String>,
    steps: StepLog,
    terminal: Option<(ResponseStatus, Value)>,
}

impl ResponseDecoder for ResponsesDecoder {
    fn feed(&mut self, chunk: &[u8], on_text: &mut dyn FnMut(&str)) -> Result<(), BridgeError> {
        for frame in self.sse.feed(chunk) {
            self.apply_frame(&frame.data, on_text)?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<ChatResult, BridgeError> {
        if !self.saw_frame && self.sse.remainder().trim_start().starts_with('{') {
            self.apply_plain_body()?;
        } else {
            for frame in self.sse.finish() {
                self.apply_frame(&frame.data, &mut |_| {})?;
            }
        }

        let Some((status, response)) = self.terminal.take() else {
            return Err(BridgeError::protocol(
                "response stream ended before a completion event",
            ));
        };
        if matches!(status, ResponseStatus::Failed | ResponseStatus::Cancelled) {
            return Err(BridgeError::StreamFailed {
                code: None,
                message: format!("response finished with status {}", status.as_str()),
            });
        }

        let mut tool_calls = Vec::with_capacity(self.calls.len());
        for call in &self.calls {
            if call.name.trim().is_empty() {
                return Err(BridgeError::protocol(format!(
                    "function call {} has no name",
                    call.call_id
                )));
            }
            let (arguments, _) = recover_arguments(
                &call.call_id,
                call.top_level.as_ref(),
                &self.steps,
                call.raw_input.as_ref(),
            );
            tool_calls.push(ToolCallRequest::new(
                call.call_id.clone(),
                call.name.clone(),
                arguments,
            ));
        }

        let finish_reason = match status {
            ResponseStatus::Incomplete => response
                .get("incomplete_details")
                .and_then(|details| details.get("reason"))
                .and_then(Value::as_str)
                .map(FinishReason::parse)
                .unwrap_or_else(|| FinishReason::Other("incomplete".to_string())),
            _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        };

        Ok(ChatResult {
            text: self.text,
            tool_calls,
            finish_reason,
        })
    }
}

impl ResponsesDecoder {
    fn apply_frame(&mut self, data: &str, on_text: &mut dyn FnMut(&str)) -> Result<(), BridgeError> {
        self.saw_frame = true;
        let value = match serde_json::from_str::<Value>(data) {
            Ok(value) => value,
            Err(error) => {
                debug!(%error, "skipping non-JSON stream frame");
                return Ok(());
            }
        };
        match map_event(value) {
            Some(event) => self.apply(event, on_text),
            None => Ok(()),
        }
    }

    /// Servers that ignore `stream: true` answer with the final response object.
    fn apply_plain_body(&mut self) -> Result<(), BridgeError> {
        let remainder = self.sse.remainder().trim();
        if remainder.is_empty() {
            return Ok(());
        }
        let value: Value = serde_json::from_str(remainder).map_err(|error| {
            BridgeError::protocol(format!("response body is neither SSE nor JSON: {error}"))
        })?;
        if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
            return Err(BridgeError::StreamFailed {
                code: error.get("code").and_then(Value::as_str).map(ToString::to_string),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("response failed")
                    .to_string(),
            });
        }
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .and_then(ResponseStatus::parse)
            .unwrap_or(ResponseStatus::Completed);
        self.apply(
            StreamEvent::ResponseCompleted {
                status,
                response: value,
            },
            &mut |_| {},
        )
    }

    fn apply(&mut self, event: StreamEvent, on_text: &mut dyn FnMut(&str)) -> Result<(), BridgeError> {
        match event {
            StreamEvent::OutputTextDelta { delta } => {
                if self.terminal.is_none() && !delta.is_empty() {
                    self.text.push_str(&delta);
                    on_text(&delta);
                }
            }
            StreamEvent::OutputItemAdded { item } => {
                if is_call_item(&item) {
                    self.upsert_call(&item);
                }
            }
            StreamEvent::FunctionCallArgumentsDelta {
                item_id,
                call_id,
                delta,
            } => {
                let key = self.step_key(item_id.as_deref(), call_id.as_deref());
                self.steps.append(&key, &delta);
            }
            StreamEvent::FunctionCallArgumentsDone {
                item_id,
                call_id,
                arguments,
            } => {
                let key = self.step_key(item_id.as_deref(), call_id.as_deref());
                self.steps.complete(&key, &arguments);
            }
            StreamEvent::OutputItemDone { item } => {
                if is_call_item(&item) {
                    self.upsert_call(&item);
                } else if self.text.is_empty() {
                    let text = message_text(&item);
                    if !text.is_empty() {
                        on_text(&text);
                        self.text = text;
                    }
                }
            }
            StreamEvent::ResponseCompleted { status, response } => {
                let output = response
                    .get("output")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for item in &output {
                    if is_call_item(item) {
                        self.upsert_call(item);
                    }
                }
                if self.text.is_empty() {
                    self.text = output.iter().map(message_text).collect::<Vec<_>>().join("");
                }
                self.terminal = Some((status, response));
            }
            StreamEvent::ResponseFailed { message } => {
                return Err(BridgeError::StreamFailed {
                    code: None,
                    message: message.unwrap_or_else(|| "response failed".to_owned()),
                });
            }
            StreamEvent::Error { code, message } => {
                return Err(BridgeError::StreamFailed {
                    message: message
                        .or_else(|| code.clone())
                        .unwrap_or_else(|| "unknown stream error".to_owned()),
                    code,
                });
            }
        }
        Ok(())
    }

    fn step_key(&self, item_id: Option<&str>, call_id: Option<&str>) -> String {
        if let Some(call_id) = call_id.filter(|id| !id.is_empty()) {
            return call_id.to_owned();
        }
        item_id
            .map(|item_id| {
                self.item_to_call
                    .get(item_id)
                    .cloned()
                    .unwrap_or_else(|| item_id.to_owned())
            })
            .unwrap_or_default()
    }

    fn upsert_call(&mut self, item: &Value) {
        let item_id = item.get("id").and_then(Value::as_str).map(ToString::to_string);
        let Some(call_id) = item
            .get("call_id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .or_else(|| item_id.clone())
        else {
            return;
        };
        if let Some(item_id) = &item_id {
            self.item_to_call.insert(item_id.clone(), call_id.clone());
        }

        let name = item
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let arguments = item.get("arguments").filter(|value| !is_empty_arguments(value));
        let input = item.get("input").filter(|value| !is_empty_arguments(value));

        match self.calls.iter_mut().find(|call| call.call_id == call_id) {
            Some(call) => {
                if call.name.is_empty() {
                    call.name = name;
                }
                if let Some(arguments) = arguments {
                    call.top_level = Some(arguments.clone());
                }
                if let Some(input) = input {
                    call.raw_input = Some(input.clone());
                }
            }
            None => self.calls.push(PendingCall {
                call_id,
                name,
                top_level: arguments.cloned(),
                raw_input: input.cloned(),
            }),
        }
    }
}

fn is_call_item(item: &Value) -> bool {
    matches!(
        item.get("type").and_then(Value::as_str),
        Some("function_call") | Some("custom_tool_call")
    )
}

fn message_text(item: &Value) -> String {
    if item.get("type").and_then(Value::as_str) != Some("message") {
        return String::new();
    }
    item.get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("output_text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}
