use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized event schema streamed to query callers. The agent loop's richer
/// internal vocabulary is filtered down to exactly these four kinds; one event
/// serializes to one self-contained JSON record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentUpdated {
        agent_name: String,
    },
    ToolCall {
        message: String,
        raw_item: Value,
    },
    ToolOutput {
        output: String,
        raw_item: Value,
    },
    MessageOutput {
        content: String,
    },
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::AgentUpdated { .. } => "agent_updated",
            AgentEvent::ToolCall { .. } => "tool_call",
            AgentEvent::ToolOutput { .. } => "tool_output",
            AgentEvent::MessageOutput { .. } => "message_output",
        }
    }
}
