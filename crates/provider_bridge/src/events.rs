use serde_json::Value;

/// Terminal state reported by a responses-style stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Completed,
    Incomplete,
    Failed,
    Cancelled,
    Queued,
    InProgress,
}

impl ResponseStatus {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "completed" => Self::Completed,
            "incomplete" => Self::Incomplete,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "queued" => Self::Queued,
            "in_progress" => Self::InProgress,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
        }
    }
}

/// Responses-stream event after normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    OutputTextDelta {
        delta: String,
    },
    /// An output item opened; function calls announce their id and name here.
    OutputItemAdded {
        item: Value,
    },
    FunctionCallArgumentsDelta {
        item_id: Option<String>,
        call_id: Option<String>,
        delta: String,
    },
    FunctionCallArgumentsDone {
        item_id: Option<String>,
        call_id: Option<String>,
        arguments: String,
    },
    OutputItemDone {
        item: Value,
    },
    ResponseCompleted {
        status: ResponseStatus,
        response: Value,
    },
    ResponseFailed {
        message: Option<String>,
    },
    Error {
        code: Option<String>,
        message: Option<String>,
    },
}

/// Maps one decoded SSE payload; unknown event types yield `None`.
pub fn map_event(value: Value) -> Option<StreamEvent> {
    let event_type = value.get("type")?.as_str()?;

    match event_type {
        "response.output_text.delta" => Some(StreamEvent::OutputTextDelta {
            delta: str_field(&value, "delta").unwrap_or_default(),
        }),
        "response.output_item.added" => Some(StreamEvent::OutputItemAdded {
            item: value.get("item").cloned().unwrap_or(Value::Null),
        }),
        "response.function_call_arguments.delta" => {
            Some(StreamEvent::FunctionCallArgumentsDelta {
                item_id: str_field(&value, "item_id"),
                call_id: str_field(&value, "call_id"),
                delta: str_field(&value, "delta").unwrap_or_default(),
            })
        }
        "response.function_call_arguments.done" => Some(StreamEvent::FunctionCallArgumentsDone {
            item_id: str_field(&value, "item_id"),
            call_id: str_field(&value, "call_id"),
            arguments: str_field(&value, "arguments").unwrap_or_default(),
        }),
        "response.output_item.done" => Some(StreamEvent::OutputItemDone {
            item: value.get("item").cloned().unwrap_or(Value::Null),
        }),
        "response.completed" | "response.done" | "response.incomplete" => {
            let response = value.get("response").cloned().unwrap_or(Value::Null);
            let default_status = if event_type == "response.incomplete" {
                ResponseStatus::Incomplete
            } else {
                ResponseStatus::Completed
            };
            let status = response
                .get("status")
                .and_then(Value::as_str)
                .and_then(ResponseStatus::parse)
                .unwrap_or(default_status);
            Some(StreamEvent::ResponseCompleted { status, response })
        }
        "response.failed" => Some(StreamEvent::ResponseFailed {
            message: value
                .get("response")
                .and_then(|response| response.get("error"))
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
                .map(ToString::to_string),
        }),
        "error" => {
            let nested = value.get("error").unwrap_or(&value);
            Some(StreamEvent::Error {
                code: str_field(nested, "code"),
                message: str_field(nested, "message"),
            })
        }
        _ => None,
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn done_alias_maps_to_completed_with_reported_status() {
        let event = map_event(json!({
            "type": "response.done",
            "response": {"status": "in_progress"}
        }));
        assert!(matches!(
            event,
            Some(StreamEvent::ResponseCompleted {
                status: ResponseStatus::InProgress,
                ..
            })
        ));
    }

    #[test]
    fn nested_error_payloads_are_flattened() {
        let event = map_event(json!({
            "type": "error",
            "error": {"code": "server_error", "message": "boom"}
        }));
        assert_eq!(
            event,
            Some(StreamEvent::Error {
                code: Some("server_error".to_string()),
                message: Some("boom".to_string())
            })
        );
    }

    #[test]
    fn unknown_events_are_ignored() {
        assert_eq!(map_event(json!({"type": "response.created"})), None);
        assert_eq!(map_event(json!({"delta": "no type"})), None);
    }
}
