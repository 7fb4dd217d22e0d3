//! Translation between engine stream-json messages and session envelopes.

use colloquy_protocol::{RunResult, ServerEnvelope};
use serde_json::Value;

use crate::engine::EngineOutput;

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(ToOwned::to_owned)
}

impl EngineOutput {
    /// Classify one engine stdout message by its `type`.
    /// Allocation: clones the nested payload. Complexity: O(n), n = payload size.
    pub fn from_json(value: Value) -> Self {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let parent_tool_use_id = str_field(&value, "parent_tool_use_id");

        match kind {
            "system" if value.get("subtype").and_then(Value::as_str) == Some("init") => {
                match str_field(&value, "session_id") {
                    Some(session_id) => Self::SessionInit {
                        session_id,
                        model: str_field(&value, "model"),
                        tools: value
                            .get("tools")
                            .and_then(Value::as_array)
                            .map(|tools| {
                                tools
                                    .iter()
                                    .filter_map(Value::as_str)
                                    .map(ToOwned::to_owned)
                                    .collect()
                            })
                            .unwrap_or_default(),
                    },
                    None => Self::other(value),
                }
            }
            "assistant" => Self::Assistant {
                message: value.get("message").cloned().unwrap_or(Value::Null),
                parent_tool_use_id,
            },
            "stream_event" => Self::StreamEvent {
                event: value.get("event").cloned().unwrap_or(Value::Null),
                parent_tool_use_id,
            },
            "result" => Self::Result(RunResult {
                session_id: str_field(&value, "session_id"),
                subtype: str_field(&value, "subtype").unwrap_or_default(),
                result: str_field(&value, "result"),
                cost: value.get("total_cost_usd").and_then(Value::as_f64),
                duration: value.get("duration_ms").and_then(Value::as_u64),
                num_turns: value
                    .get("num_turns")
                    .and_then(Value::as_u64)
                    .and_then(|turns| u32::try_from(turns).ok()),
                is_error: value
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            _ => Self::other(value),
        }
    }

    fn other(value: Value) -> Self {
        let kind = str_field(&value, "type").unwrap_or_else(|| "unknown".to_owned());
        Self::Other { kind, data: value }
    }

    /// Session token carried by this output, if it announces one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionInit { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    pub fn into_envelope(self) -> ServerEnvelope {
        match self {
            Self::SessionInit {
                session_id,
                model,
                tools,
            } => ServerEnvelope::SessionInit {
                session_id,
                model,
                tools,
            },
            Self::Assistant {
                message,
                parent_tool_use_id,
            } => ServerEnvelope::AssistantMessage {
                message,
                parent_tool_use_id,
            },
            Self::StreamEvent {
                event,
                parent_tool_use_id,
            } => ServerEnvelope::StreamEvent {
                event,
                parent_tool_use_id,
            },
            Self::Result(result) => ServerEnvelope::Result(result),
            Self::Other { kind, data } => ServerEnvelope::EngineMessage {
                engine_type: kind,
                data,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn init_message_becomes_session_init() {
        let output = EngineOutput::from_json(json!({
            "type": "system",
            "subtype": "init",
            "session_id": "sess-1",
            "model": "m-large",
            "tools": ["Read", "Bash", 7]
        }));
        assert_eq!(output.session_id(), Some("sess-1"));
        assert_eq!(
            serde_json::to_value(output.into_envelope()).expect("serialize"),
            json!({
                "type": "session_init",
                "sessionId": "sess-1",
                "model": "m-large",
                "tools": ["Read", "Bash"]
            })
        );
    }

    #[test]
    fn result_fields_are_renamed() {
        let output = EngineOutput::from_json(json!({
            "type": "result",
            "subtype": "success",
            "session_id": "sess-1",
            "result": "done",
            "total_cost_usd": 0.25,
            "duration_ms": 1200,
            "num_turns": 3,
            "is_error": false
        }));
        assert_eq!(
            output,
            EngineOutput::Result(RunResult {
                session_id: Some("sess-1".to_owned()),
                subtype: "success".to_owned(),
                result: Some("done".to_owned()),
                cost: Some(0.25),
                duration: Some(1200),
                num_turns: Some(3),
                is_error: false,
            })
        );
    }

    #[test]
    fn stream_event_keeps_parent_tool_use_id() {
        let output = EngineOutput::from_json(json!({
            "type": "stream_event",
            "event": {"type": "message_stop"},
            "parent_tool_use_id": "toolu_1"
        }));
        assert_eq!(
            output.into_envelope(),
            ServerEnvelope::StreamEvent {
                event: json!({"type": "message_stop"}),
                parent_tool_use_id: Some("toolu_1".to_owned()),
            }
        );
    }

    #[test]
    fn unmodelled_messages_pass_through_opaquely() {
        let raw = json!({"type": "user", "message": {"role": "user", "content": []}});
        let output = EngineOutput::from_json(raw.clone());
        assert_eq!(
            output.into_envelope(),
            ServerEnvelope::EngineMessage {
                engine_type: "user".to_owned(),
                data: raw,
            }
        );

        let other_system = EngineOutput::from_json(json!({"type": "system", "subtype": "compact"}));
        assert!(matches!(other_system, EngineOutput::Other { ref kind, .. } if kind == "system"));
    }
}
