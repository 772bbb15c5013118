//! Host-driven tool loop against a Responses-style streaming API.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chat_agent_error::ChatAgentError;
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::events::TurnEvent;
use crate::models::supports_native_shell;
use crate::registry::TurnContext;
use crate::sandbox::{LogChunk, LogReceiver};
use crate::tools::{failure_value, ToolBridge, ToolContext, INTEGRATION_TOOLS};

const IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const ERROR_BODY_LIMIT: usize = 1200;

pub type ProviderEvents = BoxStream<'static, Result<Value, ChatAgentError>>;

/// Opens one streamed provider response. Each item is a decoded event
/// payload carrying a `type` field.
#[async_trait]
pub trait ResponsesTransport: Send + Sync + fmt::Debug {
    async fn open(&self, request: &Value) -> Result<ProviderEvents, ChatAgentError>;
}

#[derive(Debug, Clone)]
pub struct HttpResponsesTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpResponsesTransport {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[async_trait]
impl ResponsesTransport for HttpResponsesTransport {
    async fn open(&self, request: &Value) -> Result<ProviderEvents, ChatAgentError> {
        let url = format!("{}/responses", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|err| ChatAgentError::UpstreamError {
                message: format!("Responses API request failed: {err}"),
                status: None,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatAgentError::UpstreamError {
                message: format!(
                    "Responses API {}: {}",
                    status.as_u16(),
                    truncate_chars(&body, ERROR_BODY_LIMIT)
                ),
                status: Some(status.as_u16()),
            });
        }

        let events = response
            .bytes_stream()
            .eventsource()
            .filter_map(|item| async move {
                match item {
                    Ok(event) => {
                        let data = event.data.trim();
                        if data.is_empty() || data == "[DONE]" {
                            return None;
                        }
                        let mut value: Value = match serde_json::from_str(data) {
                            Ok(value) => value,
                            Err(err) => {
                                tracing::warn!(error = %err, "skipping undecodable provider event");
                                return None;
                            }
                        };
                        if let Some(map) = value.as_object_mut() {
                            if !event.event.is_empty() && event.event != "message" {
                                map.entry("type")
                                    .or_insert_with(|| Value::String(event.event.clone()));
                            }
                        }
                        Some(Ok(value))
                    }
                    Err(err) => Some(Err(ChatAgentError::StreamError {
                        message: format!("provider stream error: {err}"),
                    })),
                }
            })
            .boxed();
        Ok(events)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Function,
    Shell,
    Patch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub call_id: String,
    pub raw_arguments: String,
    pub arguments: Value,
    pub kind: CallKind,
}

fn raw_arguments(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(raw)) => raw.clone(),
        Some(Value::Null) | None => "{}".to_string(),
        Some(other) => other.to_string(),
    }
}

fn str_field<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key).and_then(Value::as_str).filter(|value| !value.is_empty())
}

/// Maps a provider output item to a tool call. Items that are not tool calls
/// yield `None`.
pub fn normalize_call(item: &Value) -> Option<ToolCall> {
    let call_id = str_field(item, "call_id")
        .or_else(|| str_field(item, "id"))
        .unwrap_or_default()
        .to_string();
    let (name, raw, kind) = match item.get("type").and_then(Value::as_str)? {
        "function_call" | "tool_call" => {
            let name = str_field(item, "name").or_else(|| str_field(item, "tool_name"))?;
            let raw = raw_arguments(
                item.get("arguments")
                    .or_else(|| item.get("input"))
                    .or_else(|| item.get("arguments_json")),
            );
            (name.to_string(), raw, CallKind::Function)
        }
        "shell_call" => {
            let commands = item
                .get("action")
                .and_then(|action| action.get("commands"))
                .and_then(Value::as_array);
            let raw = match commands {
                Some(commands) => {
                    let command = commands
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(" && ");
                    let mut args = Map::new();
                    args.insert("command".to_string(), Value::String(command));
                    if let Some(cwd) = item
                        .get("action")
                        .and_then(|action| str_field(action, "working_directory"))
                    {
                        args.insert("cwd".to_string(), Value::String(cwd.to_string()));
                    }
                    Value::Object(args).to_string()
                }
                None => match item.get("arguments").or_else(|| item.get("input")) {
                    Some(value) => raw_arguments(Some(value)),
                    None => json!({ "command": str_field(item, "command").unwrap_or_default() })
                        .to_string(),
                },
            };
            ("shell".to_string(), raw, CallKind::Shell)
        }
        "apply_patch_call" => {
            let raw = raw_arguments(item.get("operation").or_else(|| item.get("input")));
            ("apply_patch".to_string(), raw, CallKind::Patch)
        }
        _ => return None,
    };
    let arguments = serde_json::from_str(&raw).unwrap_or_else(|_| Value::String(raw.clone()));
    Some(ToolCall {
        name,
        call_id,
        raw_arguments: raw,
        arguments,
        kind,
    })
}

fn function_tool(name: &str, description: &str, parameters: Value) -> Value {
    json!({
        "type": "function",
        "name": name,
        "description": description,
        "parameters": parameters,
    })
}

fn open_object() -> Value {
    json!({ "type": "object", "additionalProperties": true })
}

/// Tool definitions sent with every request. Integration tools are listed only
/// when the chat has them enabled.
pub fn tool_catalog(model: &str, integrations_enabled: bool) -> Vec<Value> {
    let scoped = |actions: &[&str]| {
        json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": actions },
                "method": { "type": "string", "enum": ["GET", "POST", "PATCH", "DELETE"] },
                "resource": { "type": "string" },
                "params": open_object(),
                "data": open_object(),
            },
            "required": ["action"],
            "additionalProperties": true,
        })
    };
    let path_only = json!({
        "type": "object",
        "properties": { "path": { "type": "string" } },
        "required": ["path"],
        "additionalProperties": false,
    });

    let mut tools = vec![
        function_tool(
            "crud",
            "List, create, update or delete ERP records on an allowed resource.",
            json!({
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["list", "create", "update", "delete"] },
                    "resource": { "type": "string" },
                    "params": open_object(),
                    "data": open_object(),
                    "suffix": { "type": "string" },
                },
                "required": ["action", "resource"],
                "additionalProperties": false,
            }),
        ),
        function_tool("workspace", "Workspace-scoped requests.", scoped(&["request"])),
        function_tool(
            "drive",
            "Drive folders and files. Use get_file_url for transfers.",
            scoped(&["request", "read_file", "get_file_url", "get_drive_file_url"]),
        ),
        function_tool(
            "email",
            "Inboxes and messages; send requires inbox_id and to.",
            scoped(&["request", "send", "send_email"]),
        ),
        function_tool(
            "Read",
            "Read a workspace file by line range.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "offset": { "type": "integer", "minimum": 1 },
                    "limit": { "type": "integer", "minimum": 1 },
                },
                "required": ["path"],
                "additionalProperties": false,
            }),
        ),
        function_tool(
            "Edit",
            "Replace an exact string in a workspace file.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old_string": { "type": "string" },
                    "new_string": { "type": "string" },
                    "replace_all": { "type": "boolean" },
                },
                "required": ["path", "old_string", "new_string"],
                "additionalProperties": false,
            }),
        ),
        function_tool(
            "Write",
            "Write a whole workspace file.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" },
                },
                "required": ["path", "content"],
                "additionalProperties": false,
            }),
        ),
        function_tool("Delete", "Delete a workspace file.", path_only),
    ];

    if !integrations_enabled {
        tools.retain(|tool| {
            !tool["name"]
                .as_str()
                .is_some_and(|name| INTEGRATION_TOOLS.contains(&name))
        });
    }
    if supports_native_shell(model) {
        tools.push(json!({ "type": "shell" }));
    } else {
        tools.push(function_tool(
            "shell",
            "Run a shell command in the workspace.",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "cwd": { "type": "string" },
                },
                "required": ["command"],
                "additionalProperties": false,
            }),
        ));
    }
    tools.push(json!({ "type": "apply_patch" }));
    tools
}

fn package_output(call: &ToolCall, result: &Value, success: bool) -> Value {
    match call.kind {
        CallKind::Function => json!({
            "type": "function_call_output",
            "call_id": call.call_id,
            "output": result.to_string(),
        }),
        CallKind::Shell => {
            let field = |key: &str| result.get(key).and_then(Value::as_str).unwrap_or_default();
            let output = match field("stdout") {
                "" if !success => [field("stderr"), field("error"), "shell command failed"]
                    .into_iter()
                    .find(|text| !text.is_empty())
                    .unwrap_or_default()
                    .to_string(),
                stdout => stdout.to_string(),
            };
            json!({
                "type": "shell_call_output",
                "call_id": call.call_id,
                "status": if success { "completed" } else { "failed" },
                "output": output,
            })
        }
        CallKind::Patch => {
            let output = result
                .get("output")
                .or_else(|| result.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    if success { "patch applied" } else { "patch failed" }.to_string()
                });
            json!({
                "type": "apply_patch_call_output",
                "call_id": call.call_id,
                "status": if success { "completed" } else { "failed" },
                "output": output,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponsesSettings {
    pub max_turns: usize,
    pub reasoning_effort: String,
}

/// One user turn driven through the provider and the tool bridge.
#[derive(Debug)]
pub struct ResponsesTurn {
    pub settings: ResponsesSettings,
    pub transport: Arc<dyn ResponsesTransport>,
    pub tools: Arc<ToolBridge>,
    pub context: TurnContext,
    pub prompt: String,
}

struct Emitter {
    tx: mpsc::Sender<LogChunk>,
    assistant_text: String,
    turn_text: String,
    reasoning_text: String,
    reasoning_started: bool,
}

impl Emitter {
    async fn event(&self, event: TurnEvent) {
        let mut line = event.to_line();
        line.push('\n');
        // The bridge only drops its receiver once the producer is done.
        let _ = self.tx.send(LogChunk::Stdout(line)).await;
    }

    async fn text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.assistant_text.push_str(text);
        self.turn_text.push_str(text);
        self.event(TurnEvent::Delta {
            text: text.to_string(),
        })
        .await;
    }

    async fn reasoning(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.reasoning_started {
            self.reasoning_started = true;
            self.event(TurnEvent::ReasoningStart).await;
        }
        self.reasoning_text.push_str(text);
        self.event(TurnEvent::ReasoningDelta {
            text: text.to_string(),
        })
        .await;
    }

    async fn close_reasoning(&mut self) {
        if self.reasoning_started {
            self.reasoning_started = false;
            self.event(TurnEvent::ReasoningEnd).await;
        }
    }
}

fn missing_suffix<'a>(done: &'a str, streamed: &str) -> &'a str {
    done.strip_prefix(streamed).unwrap_or_default()
}

fn provider_error(event: &Value) -> String {
    event
        .pointer("/error/message")
        .or_else(|| event.pointer("/response/error/message"))
        .or_else(|| event.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("provider stream error")
        .to_string()
}

#[derive(Debug)]
enum Abort {
    Provider(String),
    Transport(ChatAgentError),
}

impl ResponsesTurn {
    /// Runs the loop on a background task, returning its log channel.
    pub fn spawn(self, capacity: usize) -> LogReceiver {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(self.run(tx));
        rx
    }

    async fn run(self, tx: mpsc::Sender<LogChunk>) {
        let chat_id = self.context.chat_id.clone();
        let started = Instant::now();
        let mut emitter = Emitter {
            tx,
            assistant_text: String::new(),
            turn_text: String::new(),
            reasoning_text: String::new(),
            reasoning_started: false,
        };

        match self.drive(&mut emitter).await {
            Ok(response_id) => {
                emitter.close_reasoning().await;
                let text = emitter.assistant_text.clone();
                emitter.event(TurnEvent::Final { text, response_id }).await;
                tracing::info!(
                    chat_id = %chat_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "responses turn finished"
                );
            }
            Err(abort) => {
                let message = match abort {
                    Abort::Provider(message) => message,
                    Abort::Transport(err) => err.to_string(),
                };
                tracing::warn!(chat_id = %chat_id, error = %message, "responses turn aborted");
                emitter
                    .event(TurnEvent::Error {
                        error: message.clone(),
                    })
                    .await;
                emitter.close_reasoning().await;
                let _ = emitter.tx.send(LogChunk::Fatal(message)).await;
            }
        }
    }

    /// Returns the last response id on a normal finish.
    async fn drive(&self, emitter: &mut Emitter) -> Result<Option<String>, Abort> {
        let model = self.context.model.clone();
        let catalog = tool_catalog(&model, self.context.integrations_enabled);
        let tool_context = ToolContext {
            chat_id: &self.context.chat_id,
            sandbox: self.context.sandbox.as_ref(),
            external_user: self.context.external_user.as_deref(),
            integrations_enabled: self.context.integrations_enabled,
        };
        let mut response_id: Option<String> = None;
        let mut next_input = Value::String(self.prompt.clone());

        for turn in 1..=self.settings.max_turns {
            let mut request = json!({
                "model": model,
                "input": next_input,
                "stream": true,
                "reasoning": { "effort": self.settings.reasoning_effort, "summary": "concise" },
                "tools": catalog,
            });
            if let (Some(previous), Some(map)) = (response_id.as_ref(), request.as_object_mut()) {
                map.insert(
                    "previous_response_id".to_string(),
                    Value::String(previous.clone()),
                );
            }

            let mut events = self
                .transport
                .open(&request)
                .await
                .map_err(Abort::Transport)?;
            emitter.turn_text.clear();
            let turn_reasoning_start = emitter.reasoning_text.len();
            let mut completed: Option<Value> = None;
            let mut fallback = Vec::new();

            loop {
                let next = tokio::time::timeout(IDLE_TIMEOUT, events.next())
                    .await
                    .map_err(|_| {
                        Abort::Transport(ChatAgentError::Timeout {
                            message: Some(format!(
                                "no provider event for {}s",
                                IDLE_TIMEOUT.as_secs()
                            )),
                        })
                    })?;
                let Some(event) = next else { break };
                let event = event.map_err(Abort::Transport)?;
                let kind = event.get("type").and_then(Value::as_str).unwrap_or_default();
                match kind {
                    "response.created" => {
                        if let Some(id) = event
                            .pointer("/response/id")
                            .or_else(|| event.get("id"))
                            .and_then(Value::as_str)
                        {
                            response_id = Some(id.to_string());
                        }
                    }
                    "response.output_text.delta" => {
                        let delta = event.get("delta").and_then(Value::as_str).unwrap_or_default();
                        emitter.text(delta).await;
                    }
                    "response.output_text.done" => {
                        let done = event.get("text").and_then(Value::as_str).unwrap_or_default();
                        let missing = missing_suffix(done, &emitter.turn_text).to_string();
                        emitter.text(&missing).await;
                    }
                    "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                        let delta = event.get("delta").and_then(Value::as_str).unwrap_or_default();
                        emitter.reasoning(delta).await;
                    }
                    "response.reasoning_summary_text.done" | "response.reasoning_text.done" => {
                        let done = event.get("text").and_then(Value::as_str).unwrap_or_default();
                        let streamed = emitter.reasoning_text[turn_reasoning_start..].to_string();
                        let missing = missing_suffix(done, &streamed).to_string();
                        emitter.reasoning(&missing).await;
                    }
                    "response.output_item.done" => {
                        if let Some(call) = event.get("item").and_then(normalize_call) {
                            fallback.push(call);
                        }
                    }
                    "response.completed" => {
                        let response = event.get("response").cloned().unwrap_or_else(|| event.clone());
                        if let Some(id) = response.get("id").and_then(Value::as_str) {
                            response_id = Some(id.to_string());
                        }
                        completed = Some(response);
                    }
                    "error" | "response.failed" => {
                        return Err(Abort::Provider(provider_error(&event)));
                    }
                    _ => {}
                }
            }

            let mut calls: Vec<ToolCall> = completed
                .as_ref()
                .and_then(|response| response.get("output"))
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(normalize_call).collect())
                .unwrap_or_default();
            if calls.is_empty() {
                calls = fallback;
            }
            tracing::debug!(
                chat_id = %self.context.chat_id,
                turn,
                tool_calls = calls.len(),
                "responses round-trip complete"
            );
            if calls.is_empty() {
                return Ok(response_id);
            }

            let mut outputs = Vec::with_capacity(calls.len());
            for (index, mut call) in calls.into_iter().enumerate() {
                if call.call_id.is_empty() {
                    call.call_id = format!("call-{turn}-{index}");
                }
                outputs.push(self.dispatch(emitter, &tool_context, call, index).await);
            }
            next_input = Value::Array(outputs);
        }

        let message = format!(
            "tool loop stopped after {} provider turns",
            self.settings.max_turns
        );
        tracing::warn!(chat_id = %self.context.chat_id, "{message}");
        emitter.event(TurnEvent::Error { error: message }).await;
        Ok(response_id)
    }

    async fn dispatch(
        &self,
        emitter: &Emitter,
        tool_context: &ToolContext<'_>,
        call: ToolCall,
        index: usize,
    ) -> Value {
        emitter
            .event(TurnEvent::ToolInputStart {
                name: Some(call.name.clone()),
                call_id: Some(call.call_id.clone()),
                index: Some(index as u64),
            })
            .await;
        if !call.raw_arguments.is_empty() {
            emitter
                .event(TurnEvent::ToolInputDelta {
                    partial: call.raw_arguments.clone(),
                })
                .await;
        }
        emitter
            .event(TurnEvent::ToolInputDone {
                input: Some(call.arguments.clone()),
                name: Some(call.name.clone()),
                call_id: Some(call.call_id.clone()),
            })
            .await;

        let started = Instant::now();
        let result = self
            .tools
            .dispatch(tool_context, &call.name, call.arguments.clone())
            .await;
        tracing::info!(
            chat_id = %self.context.chat_id,
            tool = %call.name,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool call dispatched"
        );

        match result {
            Ok(output) => {
                let success = output
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let event = if success {
                    TurnEvent::ToolDone {
                        tool_name: Some(call.name.clone()),
                        output: output.clone(),
                        call_id: Some(call.call_id.clone()),
                    }
                } else {
                    // Backend refusals come back as results; the UI still shows them failed.
                    TurnEvent::ToolError {
                        tool_name: Some(call.name.clone()),
                        error: output.get("error").cloned().unwrap_or_else(|| output.clone()),
                        call_id: Some(call.call_id.clone()),
                    }
                };
                emitter.event(event).await;
                package_output(&call, &output, success)
            }
            Err(err) => {
                let failure = failure_value(&err);
                emitter
                    .event(TurnEvent::ToolError {
                        tool_name: Some(call.name.clone()),
                        error: Value::String(err.short_message()),
                        call_id: Some(call.call_id.clone()),
                    })
                    .await;
                package_output(&call, &failure, false)
            }
        }
    }
}
