use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::events::{error_text, TurnEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ToolPartState {
    OutputAvailable,
    OutputError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningState {
    Done,
}

/// Persisted projection of one assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptPart {
    Text {
        text: String,
    },
    Reasoning {
        content: String,
        state: ReasoningState,
    },
    Tool {
        tool_name: String,
        state: ToolPartState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[schema(value_type = Option<Object>)]
        input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[schema(value_type = Option<Object>)]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_text: Option<String>,
    },
}

#[derive(Debug, Default)]
struct PendingTool {
    name: Option<String>,
    partial: String,
    input: Option<Value>,
}

/// Folds turn events, in arrival order, into transcript parts.
///
/// Free text is buffered and flushed as its own part whenever a reasoning or
/// tool block begins, so the folded parts keep emission order.
#[derive(Debug, Default)]
pub struct TranscriptFolder {
    parts: Vec<TranscriptPart>,
    all_text: String,
    segment: String,
    reasoning: Option<String>,
    tool: Option<PendingTool>,
}

impl TranscriptFolder {
    pub fn new() -> Self {
        Self::default()
    }

    fn flush_text(&mut self) {
        let segment = self.segment.trim();
        if !segment.is_empty() {
            self.parts.push(TranscriptPart::Text {
                text: segment.to_string(),
            });
        }
        self.segment.clear();
    }

    fn close_reasoning(&mut self) {
        if let Some(content) = self.reasoning.take() {
            self.parts.push(TranscriptPart::Reasoning {
                content,
                state: ReasoningState::Done,
            });
        }
    }

    fn finish_tool(
        &mut self,
        tool_name: Option<String>,
        state: ToolPartState,
        output: Option<Value>,
        error: Option<String>,
    ) {
        self.flush_text();
        let pending = self.tool.take().unwrap_or_default();
        let tool_name = tool_name
            .or(pending.name)
            .unwrap_or_else(|| "generic".to_string());
        self.parts.push(TranscriptPart::Tool {
            tool_name,
            state,
            input: pending.input,
            output,
            error_text: error,
        });
    }

    pub fn apply(&mut self, event: &TurnEvent) {
        match event {
            TurnEvent::Delta { text } => {
                self.all_text.push_str(text);
                self.segment.push_str(text);
            }
            TurnEvent::ReasoningStart => {
                self.flush_text();
                self.close_reasoning();
                self.reasoning = Some(String::new());
            }
            TurnEvent::ReasoningDelta { text } => {
                if let Some(reasoning) = self.reasoning.as_mut() {
                    reasoning.push_str(text);
                }
            }
            TurnEvent::ReasoningEnd => self.close_reasoning(),
            TurnEvent::ToolInputStart { name, .. } => {
                self.flush_text();
                self.tool = Some(PendingTool {
                    name: name.clone(),
                    ..PendingTool::default()
                });
            }
            TurnEvent::ToolInputDelta { partial } => {
                self.tool
                    .get_or_insert_with(PendingTool::default)
                    .partial
                    .push_str(partial);
            }
            TurnEvent::ToolInputDone { input, name, .. } => {
                let tool = self.tool.get_or_insert_with(PendingTool::default);
                if tool.name.is_none() {
                    tool.name = name.clone();
                }
                tool.input = match input {
                    Some(input) => Some(input.clone()),
                    None => {
                        let raw = tool.partial.trim();
                        if raw.is_empty() {
                            None
                        } else {
                            Some(
                                serde_json::from_str(raw)
                                    .unwrap_or_else(|_| Value::String(raw.to_string())),
                            )
                        }
                    }
                };
            }
            TurnEvent::ToolDone {
                tool_name, output, ..
            } => self.finish_tool(
                tool_name.clone(),
                ToolPartState::OutputAvailable,
                Some(output.clone()),
                None,
            ),
            TurnEvent::ToolError {
                tool_name, error, ..
            } => self.finish_tool(
                tool_name.clone(),
                ToolPartState::OutputError,
                None,
                Some(error_text(error)),
            ),
            TurnEvent::Error { .. } | TurnEvent::Final { .. } => {}
        }
    }

    /// Closes open blocks and returns the parts. When folding produced
    /// nothing, falls back to a single part holding all streamed text.
    pub fn finish(mut self) -> Vec<TranscriptPart> {
        self.close_reasoning();
        self.flush_text();
        if self.parts.is_empty() {
            let text = self.all_text.trim();
            if !text.is_empty() {
                self.parts.push(TranscriptPart::Text {
                    text: text.to_string(),
                });
            }
        }
        self.parts
    }
}
