use agent_provider::{
    ChatRequest, ChatResult, FinishReason, Message, Role, ToolCallRequest, ToolDefinition,
};
use provider_registry::WireVariant;
use serde_json::{json, Map, Value};

use super::{tool_arguments_text, ResponseDecoder, WireCodec};
use crate::error::BridgeError;
use crate::recovery::{recover_arguments, StepLog};

/// Classic `/chat/completions`: one JSON request, one JSON response.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChatCompletionsCodec;

impl WireCodec for ChatCompletionsCodec {
    fn variant(&self) -> WireVariant {
        WireVariant::ChatCompletions
    }

    fn build_request(&self, model: &str, request: &ChatRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.instructions.trim().is_empty() {
            messages.push(json!({"role": "system", "content": request.instructions}));
        }
        messages.extend(request.messages.iter().map(encode_message));

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(encode_tool).collect());
            body["tool_choice"] = Value::String("auto".to_string());
        }
        body
    }

    fn decoder(&self) -> Box<dyn ResponseDecoder> {
        Box::new(ChatCompletionsDecoder::default())
    }
}

fn encode_message(message: &Message) -> Value {
    match message.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.as_deref().unwrap_or_default(),
            "content": message.content,
        }),
        Role::Assistant if !message.tool_calls.is_empty() => {
            let calls = message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.tool_name,
                            "arguments": tool_arguments_text(&call.arguments),
                        },
                    })
                })
                .collect::<Vec<_>>();
            let content = if message.content.is_empty() {
                Value::Null
            } else {
                Value::String(message.content.clone())
            };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
        role => json!({"role": role.as_str(), "content": message.content}),
    }
}

fn encode_tool(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        },
    })
}

#[derive(Debug, Default)]
struct ChatCompletionsDecoder {
    body: Vec<u8>,
}

impl ResponseDecoder for ChatCompletionsDecoder {
    fn feed(&mut self, chunk: &[u8], _on_text: &mut dyn FnMut(&str)) -> Result<(), BridgeError> {
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<ChatResult, BridgeError> {
        let value: Value = serde_json::from_slice(&self.body).map_err(|error| {
            BridgeError::protocol(format!(
                "chat completions response is not valid JSON ({error}): {}",
                preview(&self.body)
            ))
        })?;
        decode_response(&value)
    }
}

fn decode_response(value: &Value) -> Result<ChatResult, BridgeError> {
    if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(BridgeError::StreamFailed {
            code: error.get("code").filter(|code| !code.is_null()).map(|code| {
                code.as_str()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| code.to_string())
            }),
            message,
        });
    }

    let choice = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or_else(|| {
            BridgeError::protocol(format!(
                "chat completions response has no choices: {}",
                preview(value.to_string().as_bytes())
            ))
        })?;
    let message = choice
        .get("message")
        .filter(|message| message.is_object())
        .ok_or_else(|| BridgeError::protocol("chat completions choice has no message"))?;

    let mut steps = StepLog::default();
    for holder in [value, choice, message] {
        collect_steps(holder.get("steps"), &mut steps);
    }

    let text = content_text(message.get("content"));
    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for (index, call) in calls.iter().enumerate() {
            tool_calls.push(decode_tool_call(index, call, &steps)?);
        }
    }

    let finish_reason = match choice.get("finish_reason").and_then(Value::as_str) {
        Some(reason) => {
            let parsed = FinishReason::parse(reason);
            if parsed == FinishReason::Stop && !tool_calls.is_empty() {
                FinishReason::ToolCalls
            } else {
                parsed
            }
        }
        None if tool_calls.is_empty() => FinishReason::Stop,
        None => FinishReason::ToolCalls,
    };

    Ok(ChatResult {
        text,
        tool_calls,
        finish_reason,
    })
}

fn decode_tool_call(
    index: usize,
    call: &Value,
    steps: &StepLog,
) -> Result<ToolCallRequest, BridgeError> {
    let function = call.get("function").unwrap_or(call);
    let name = function
        .get("name")
        .or_else(|| call.get("name"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            BridgeError::protocol(format!("tool call #{index} has no function name: {call}"))
        })?;
    let id = call
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("call_{index}"));

    let top_level = function.get("arguments").or_else(|| call.get("arguments"));
    let raw_input = function.get("input").or_else(|| call.get("input"));
    let (arguments, _) = recover_arguments(&id, top_level, steps, raw_input);

    Ok(ToolCallRequest::new(id, name, arguments))
}

fn collect_steps(steps: Option<&Value>, log: &mut StepLog) {
    let Some(steps) = steps.and_then(Value::as_array) else {
        return;
    };
    for step in steps {
        let call_id = ["tool_call_id", "call_id", "id"]
            .iter()
            .find_map(|key| step.get(*key).and_then(Value::as_str));
        let Some(call_id) = call_id else {
            continue;
        };
        let arguments = step
            .get("arguments")
            .or_else(|| step.get("function").and_then(|function| function.get("arguments")))
            .or_else(|| step.get("input"));
        if let Some(arguments) = arguments {
            log.record_value(call_id, arguments);
        }
    }
}

fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                Value::Object(fields) => text_part(fields),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn text_part(fields: &Map<String, Value>) -> Option<&str> {
    match fields.get("type").and_then(Value::as_str) {
        Some("text") | Some("output_text") | None => fields.get("text").and_then(Value::as_str),
        _ => None,
    }
}

fn preview(bytes: &[u8]) -> String {
    const LIMIT: usize = 512;
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() <= LIMIT {
        return text.into_owned();
    }
    let mut clipped: String = text.chars().take(LIMIT).collect();
    clipped.push_str("...");
    clipped
}

#[cfg(test)]
mod tests {
    use agent_provider::ToolResult;
    use pretty_assertions::assert_eq;

    use super::*;

    fn request() -> ChatRequest {
        let call = ToolCallRequest::new("call_1", "write_file", json!({"path": "a.rs"}));
        ChatRequest {
            instructions: "be terse".to_string(),
            messages: vec![
                Message::user("add function X"),
                Message::assistant("", vec![call]),
                Message::tool_result(&ToolResult::success("call_1", "write_file", "ok")),
            ],
            tools: vec![ToolDefinition {
                name: "write_file".to_string(),
                description: "Write a file".to_string(),
                input_schema: json!({"type": "object"}),
            }],
        }
    }

    #[test]
    fn request_encodes_history_and_tools() {
        let body = ChatCompletionsCodec.build_request("glm-4.7", &request());

        assert_eq!(body["model"], "glm-4.7");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "be terse"}));
        assert_eq!(body["messages"][2]["content"], Value::Null);
        assert_eq!(
            body["messages"][2]["tool_calls"][0]["function"]["arguments"],
            r#"{"path":"a.rs"}"#
        );
        assert_eq!(
            body["messages"][3],
            json!({"role": "tool", "tool_call_id": "call_1", "content": "ok"})
        );
        assert_eq!(body["tools"][0]["function"]["name"], "write_file");
    }

    #[test]
    fn parses_text_response() {
        let body = br#"{"choices":[{"message":{"role":"assistant","content":"Done"},"finish_reason":"stop"}]}"#;
        let result = ChatCompletionsCodec.parse(body).expect("parse");
        assert_eq!(result, ChatResult::text("Done"));
    }

    #[test]
    fn recovers_arguments_from_message_steps() {
        let body = br#"{"choices":[{"message":{
            "content":"",
            "tool_calls":[{"id":"c9","type":"function","function":{"name":"write_file","arguments":""}}],
            "steps":[{"tool_call_id":"c9","arguments":"{\"path\":\"x.rs\",\"content\":\"fn x() {}\"}"}]
        },"finish_reason":"tool_calls"}]}"#;

        let result = ChatCompletionsCodec.parse(body).expect("parse");
        assert_eq!(result.finish_reason, FinishReason::ToolCalls);
        assert_eq!(
            result.tool_calls,
            vec![ToolCallRequest::new(
                "c9",
                "write_file",
                json!({"path": "x.rs", "content": "fn x() {}"})
            )]
        );
    }

    #[test]
    fn recovers_arguments_from_raw_input_field() {
        let body = br#"{"choices":[{"message":{
            "tool_calls":[{"id":"c1","function":{"name":"bash","arguments":"{}","input":{"command":"ls"}}}]
        }}]}"#;

        let result = ChatCompletionsCodec.parse(body).expect("parse");
        assert_eq!(result.tool_calls[0].arguments, json!({"command": "ls"}));
        assert_eq!(result.finish_reason, FinishReason::ToolCalls);
    }

    #[test]
    fn missing_choices_is_protocol_error() {
        let error = ChatCompletionsCodec
            .parse(br#"{"id":"x"}"#)
            .expect_err("no choices");
        assert!(matches!(error, BridgeError::Protocol(message) if message.contains("no choices")));
    }

    #[test]
    fn embedded_error_object_is_surfaced() {
        let error = ChatCompletionsCodec
            .parse(br#"{"error":{"message":"model overloaded","code":"1305"}}"#)
            .expect_err("error body");
        assert_eq!(error.to_string(), "stream failed (1305): model overloaded");
    }

    #[test]
    fn content_parts_are_concatenated() {
        let body = br#"{"choices":[{"message":{"content":[{"type":"text","text":"a"},{"type":"image"},{"type":"text","text":"b"}]}}]}"#;
        assert_eq!(ChatCompletionsCodec.parse(body).expect("parse").text, "ab");
    }
}
