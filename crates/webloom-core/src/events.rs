use serde_json::{json, Value};

use webloom_providers::StreamChunk;
use webloom_types::AgentEvent;

/// One buffered tool invocation: the provider streams the name first and the
/// argument text in fragments.
#[derive(Debug, Clone, Default)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// The agent loop's internal vocabulary. Consumers never see this directly;
/// `normalize_run_item` filters it down to the external four-kind schema.
#[derive(Debug, Clone)]
pub enum RunItem {
    /// Low-level transport chunk, kept for diagnostics only.
    Raw(StreamChunk),
    AgentUpdated {
        agent_name: String,
    },
    ToolCallRequested {
        call: ToolInvocation,
    },
    ToolCallCompleted {
        call: ToolInvocation,
        output: String,
    },
    MessageProduced {
        content: String,
    },
    /// Per-turn bookkeeping (finish reason); not part of the external schema.
    TurnCompleted {
        finish_reason: String,
    },
}

/// Map an internal run item to the external event schema. Raw transport
/// chunks and bookkeeping items are suppressed; everything else re-maps to
/// exactly one of the four external kinds.
pub fn normalize_run_item(item: &RunItem) -> Option<AgentEvent> {
    match item {
        RunItem::Raw(_) => None,
        RunItem::AgentUpdated { agent_name } => Some(AgentEvent::AgentUpdated {
            agent_name: agent_name.clone(),
        }),
        RunItem::ToolCallRequested { call } => Some(AgentEvent::ToolCall {
            message: "Tool was called".to_string(),
            raw_item: normalize_call_payload(call),
        }),
        RunItem::ToolCallCompleted { call, output } => Some(AgentEvent::ToolOutput {
            output: output.clone(),
            raw_item: normalize_call_payload(call),
        }),
        RunItem::MessageProduced { content } => Some(AgentEvent::MessageOutput {
            content: content.clone(),
        }),
        RunItem::TurnCompleted { .. } => None,
    }
}

/// Best-effort structured rendering of a tool call: parsed argument object
/// when the arguments are valid JSON, a generic dump when there is argument
/// text that does not parse, and a plain string as the last resort.
pub fn normalize_call_payload(call: &ToolInvocation) -> Value {
    if let Ok(args @ Value::Object(_)) = serde_json::from_str::<Value>(&call.arguments) {
        return json!({
            "id": call.id,
            "name": call.name,
            "arguments": args,
        });
    }
    if !call.arguments.trim().is_empty() {
        return json!({
            "id": call.id,
            "name": call.name,
            "arguments": call.arguments,
        });
    }
    Value::String(format!("{}()", call.name))
}
