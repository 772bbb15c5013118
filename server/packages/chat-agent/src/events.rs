//! Turn events shared by both provider adapters.
//!
//! Adapters emit these as JSON lines on a log stream; the streaming bridge
//! forwards each line verbatim and folds the recognised ones into transcript
//! parts.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    #[serde(alias = "text_delta")]
    Delta { text: String },
    ReasoningStart,
    ReasoningDelta { text: String },
    ReasoningEnd,
    ToolInputStart {
        #[serde(default, alias = "tool_name")]
        name: Option<String>,
        #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u64>,
    },
    ToolInputDelta { partial: String },
    ToolInputDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(default, alias = "tool_name", skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },
    ToolDone {
        #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default)]
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },
    ToolError {
        #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default)]
        error: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },
    /// Non-recoverable failure of the provider conversation.
    Error { error: String },
    Final {
        #[serde(default)]
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
}

impl TurnEvent {
    /// Parses one log line. Lines that are not JSON objects, or whose `type`
    /// is outside the vocabulary, yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }

    pub fn to_line(&self) -> String {
        // Every variant serializes to a JSON object; fall back to an error
        // line rather than dropping the event.
        serde_json::to_string(self).unwrap_or_else(|err| {
            format!("{{\"type\":\"error\",\"error\":\"failed to encode event: {err}\"}}")
        })
    }
}

/// Human-readable text for a tool error payload, which providers send either
/// as a string or a structured object.
pub fn error_text(error: &Value) -> String {
    match error {
        Value::String(text) => text.clone(),
        Value::Null => "tool failed".to_string(),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_runner_lines_with_aliases() {
        assert_eq!(
            TurnEvent::parse_line(r#"{"type":"tool_input_start","index":0,"id":"toolu_1","name":"Read"}"#),
            Some(TurnEvent::ToolInputStart {
                name: Some("Read".into()),
                call_id: Some("toolu_1".into()),
                index: Some(0),
            })
        );
        assert_eq!(
            TurnEvent::parse_line(r#"{"type":"tool_error","tool_name":"crud","error":{"message":"boom"}}"#),
            Some(TurnEvent::ToolError {
                tool_name: Some("crud".into()),
                error: json!({"message": "boom"}),
                call_id: None,
            })
        );
    }

    #[test]
    fn unknown_types_and_plain_text_are_not_events() {
        assert_eq!(TurnEvent::parse_line(r#"{"type":"agents_list","agents":[]}"#), None);
        assert_eq!(TurnEvent::parse_line("npm WARN deprecated"), None);
    }

    #[test]
    fn serializes_with_snake_case_tags() {
        let line = TurnEvent::Delta { text: "hi".into() }.to_line();
        assert_eq!(line, r#"{"type":"delta","text":"hi"}"#);
        assert_eq!(TurnEvent::ReasoningEnd.to_line(), r#"{"type":"reasoning_end"}"#);
    }

    #[test]
    fn error_text_prefers_message_fields() {
        assert_eq!(error_text(&json!("plain")), "plain");
        assert_eq!(error_text(&json!({"error": "nested"})), "nested");
        assert_eq!(error_text(&json!(42)), "42");
    }
}
