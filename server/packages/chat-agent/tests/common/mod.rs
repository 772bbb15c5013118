#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chat_agent::adapters::responses::ProviderEvents;
use chat_agent::adapters::ResponsesTransport;
use chat_agent::config::BridgeConfig;
use chat_agent::registry::{RegistryConfig, SessionRegistry};
use chat_agent::router::{build_router_with_state, AppState, AuthConfig};
use chat_agent::sandbox::LocalSandboxProvider;
use chat_agent::store::MemoryChatStore;
use chat_agent_error::ChatAgentError;
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    pub dir: TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::build(AuthConfig::disabled(), BridgeConfig::default(), None)
    }

    pub fn with_auth(auth: AuthConfig) -> Self {
        Self::build(auth, BridgeConfig::default(), None)
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        Self::build(AuthConfig::disabled(), config, None)
    }

    pub fn with_transport(transport: Arc<dyn ResponsesTransport>) -> Self {
        Self::build(AuthConfig::disabled(), BridgeConfig::default(), Some(transport))
    }

    fn build(
        auth: AuthConfig,
        config: BridgeConfig,
        transport: Option<Arc<dyn ResponsesTransport>>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("create temp data dir");
        let provider = LocalSandboxProvider::new(dir.path()).expect("create sandbox provider");
        let registry = SessionRegistry::new(
            Arc::new(provider),
            Arc::new(MemoryChatStore::new()),
            RegistryConfig::default(),
        );
        let mut state = AppState::new(auth, registry, config);
        if let Some(transport) = transport {
            state = state.with_transport(transport);
        }
        let (app, state) = build_router_with_state(Arc::new(state));
        Self { app, state, dir }
    }

    pub async fn action(&self, body: Value) -> (StatusCode, Value) {
        send_json(&self.app, Method::POST, "/v1/chat", Some(body), &[]).await
    }

    /// Starts a session and returns its chat id.
    pub async fn start_chat(&self, chat_id: &str) -> String {
        let (status, payload) = self
            .action(json!({ "action": "chat-start", "chatId": chat_id }))
            .await;
        assert_eq!(status, StatusCode::OK, "chat-start: {payload}");
        payload["chatId"].as_str().expect("chat id").to_string()
    }

    /// Capability token the runner scripts would receive for `chat_id`.
    pub async fn capability_token(&self, chat_id: &str) -> String {
        let session = self.state.registry().get(chat_id).await.expect("session");
        session.turn_context().await.token
    }

    pub async fn call_tool(&self, chat_id: &str, tool: &str, args: Value) -> (StatusCode, Value) {
        let token = self.capability_token(chat_id).await;
        let authorization = format!("Bearer {token}");
        send_json(
            &self.app,
            Method::POST,
            &format!("/v1/agent-tools/{tool}"),
            Some(args),
            &[("authorization", authorization.as_str()), ("x-chat-id", chat_id)],
        )
        .await
    }
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder
        .body(Body::from(body.map(|value| value.to_string()).unwrap_or_default()))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let payload = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, payload)
}

/// Posts an action whose answer is an event stream and collects every frame
/// as `(event, data)` until the server closes it.
pub async fn read_sse(app: &Router, body: Value) -> (StatusCode, Vec<(String, String)>) {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let text = String::from_utf8_lossy(&bytes).into_owned();
    (status, parse_frames(&text))
}

fn parse_frames(text: &str) -> Vec<(String, String)> {
    let mut frames = Vec::new();
    for block in text.split("\n\n") {
        let mut event = String::new();
        let mut data = Vec::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
        }
        if !event.is_empty() || !data.is_empty() {
            frames.push((event, data.join("\n")));
        }
    }
    frames
}

/// Parsed turn events carried by the `data` frames of a stream.
pub fn turn_events(frames: &[(String, String)]) -> Vec<Value> {
    frames
        .iter()
        .filter(|(event, _)| event.is_empty() || event == "data")
        .filter_map(|(_, data)| serde_json::from_str(data).ok())
        .collect()
}

/// Replays canned provider rounds and records every request it was sent.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    rounds: Mutex<VecDeque<Vec<Value>>>,
    pub requests: Mutex<Vec<Value>>,
}

impl ScriptedTransport {
    pub fn new(rounds: Vec<Vec<Value>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl ResponsesTransport for ScriptedTransport {
    async fn open(&self, request: &Value) -> Result<ProviderEvents, ChatAgentError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let round = self
            .rounds
            .lock()
            .expect("rounds lock")
            .pop_front()
            .ok_or_else(|| ChatAgentError::UpstreamError {
                message: "script exhausted".to_string(),
                status: None,
            })?;
        Ok(futures::stream::iter(round.into_iter().map(Ok)).boxed())
    }
}
