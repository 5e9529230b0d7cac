use agent_provider::ToolDefinition;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_arguments, Tool, ToolContext, ToolOutput};
use crate::error::ToolExecutionError;
use crate::status::StatusSink;

/// Publishes a one-line progress status to the presentation layer.
#[derive(Debug, Clone)]
pub struct SetStatusTool {
    sink: StatusSink,
}

impl SetStatusTool {
    pub fn new(sink: StatusSink) -> Self {
        Self { sink }
    }
}

#[derive(Debug, Deserialize)]
struct SetStatusArgs {
    status: String,
}

impl Tool for SetStatusTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "set_status".to_string(),
            description: "Update the short progress status shown to the user during long tasks."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "status": {"type": "string"}
                },
                "required": ["status"]
            }),
        }
    }

    fn execute(
        &self,
        arguments: &Value,
        _ctx: &ToolContext<'_>,
    ) -> Result<ToolOutput, ToolExecutionError> {
        let args: SetStatusArgs = parse_arguments("set_status", arguments)?;
        let status = args.status.trim();
        if status.is_empty() {
            self.sink.clear();
            return Ok(ToolOutput::ok("Status cleared"));
        }
        self.sink.set(status);
        Ok(ToolOutput::ok(format!("Status set: {status}")))
    }
}
