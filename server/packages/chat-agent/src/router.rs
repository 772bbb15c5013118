use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use base64::Engine;
use chat_agent_error::{ChatAgentError, ErrorType, ProblemDetails};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::adapters::{self, HttpResponsesTransport, ResponsesTransport, RunnerKind};
use crate::config::BridgeConfig;
use crate::prompt::HistoryMessage;
use crate::registry::{SessionRegistry, TurnGuard};
use crate::sandbox::{resolve_path, DirEntry};
use crate::store::{ChatMessage, ChatStore};
use crate::stream_bridge::{bridge, sse_response, BridgeOptions, BridgeOutcome, CompletionHook};
use crate::tools::{failure_value, ToolBridge, ToolContext};

#[derive(Debug)]
pub struct AppState {
    auth: AuthConfig,
    registry: Arc<SessionRegistry>,
    tools: Arc<ToolBridge>,
    config: BridgeConfig,
    transport: Option<Arc<dyn ResponsesTransport>>,
}

impl AppState {
    pub fn new(auth: AuthConfig, registry: SessionRegistry, config: BridgeConfig) -> Self {
        let transport = config.openai_api_key.as_deref().map(|key| {
            Arc::new(HttpResponsesTransport::new(config.openai_base_url.clone(), key))
                as Arc<dyn ResponsesTransport>
        });
        Self {
            auth,
            registry: Arc::new(registry),
            tools: Arc::new(ToolBridge::from_config(&config)),
            config,
            transport,
        }
    }

    /// Replaces the Responses transport, e.g. with a scripted one.
    pub fn with_transport(mut self, transport: Arc<dyn ResponsesTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub async fn shutdown_sessions(state: &Arc<AppState>) {
    state.registry.stop_all().await;
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/chat", post(post_chat_action))
        .route("/agent-tools/:tool", post(post_agent_tool))
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        v1_router = v1_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let mut router = Router::new()
        .route("/", get(get_root))
        .nest("/v1", v1_router)
        .fallback(not_found);

    let http_logging = match std::env::var("CHAT_AGENT_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let include_headers = std::env::var("CHAT_AGENT_LOG_HTTP_HEADERS").is_ok();
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(move |req: &Request<_>| {
                if include_headers {
                    let headers: Vec<(String, String)> = req
                        .headers()
                        .iter()
                        .map(|(name, value)| {
                            let shown = if name.as_str().eq_ignore_ascii_case("authorization") {
                                "<redacted>".to_string()
                            } else {
                                value.to_str().unwrap_or("<binary>").to_string()
                            };
                            (name.as_str().to_string(), shown)
                        })
                        .collect();
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri(),
                        headers = ?headers
                    )
                } else {
                    tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
                }
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, post_chat_action, post_agent_tool),
    components(schemas(
        HealthResponse,
        ChatActionRequest,
        DirEntry,
        ProblemDetails,
        ErrorType
    )),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "chat", description = "Chat sessions and turns"),
        (name = "tools", description = "Agent tool callbacks")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2468")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Agent(#[from] ChatAgentError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Agent(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
}

/// Body of `POST /v1/chat`. Fields other than `action` and `chatId` depend
/// on the action.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatActionRequest {
    pub action: String,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub fields: Map<String, Value>,
}

impl ChatActionRequest {
    fn chat_id(&self) -> Result<&str, ChatAgentError> {
        self.chat_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ChatAgentError::invalid("chatId is required"))
    }

    fn params<T: DeserializeOwned>(&self) -> Result<T, ChatAgentError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|err| {
            ChatAgentError::invalid(format!("invalid {} request: {err}", self.action))
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartParams {
    #[serde(default)]
    external_user: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendParams {
    #[serde(default)]
    history: Vec<HistoryMessage>,
    #[serde(default)]
    client_message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelParams {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    provider: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlashParams {
    #[serde(default)]
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct ToggleParams {
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct PathParams {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WriteParams {
    path: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct PatchParams {
    operation: Value,
}

#[derive(Serialize)]
struct Ack<T: Serialize> {
    ok: bool,
    #[serde(flatten)]
    body: T,
}

fn ack<T: Serialize>(body: T) -> Response {
    Json(Ack { ok: true, body }).into_response()
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        sessions: state.registry.session_count().await,
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    post,
    path = "/v1/chat",
    request_body = ChatActionRequest,
    responses(
        (status = 200, description = "Action result, or an SSE stream for chat-send-stream and chat-slash"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chat_action(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatActionRequest>,
) -> Result<Response, ApiError> {
    tracing::debug!(action = %request.action, chat_id = ?request.chat_id, "chat action");
    let registry = &state.registry;
    let response = match request.action.as_str() {
        "chat-start" => {
            let params: StartParams = request.params()?;
            let outcome = registry
                .start(request.chat_id.as_deref(), params.external_user)
                .await?;
            ack(outcome)
        }
        "chat-stop" => {
            let snapshot = registry.stop(request.chat_id()?).await?;
            ack(json!({ "snapshotId": snapshot }))
        }
        "chat-send-stream" => return send_stream(&state, &request).await,
        "chat-slash" => return slash_stream(&state, &request).await,
        "model-set" => {
            let params: ModelParams = request.params()?;
            let (provider, model) = registry
                .set_model(
                    request.chat_id()?,
                    params.model.as_deref(),
                    params.provider.as_deref(),
                )
                .await?;
            ack(json!({ "provider": provider, "model": model }))
        }
        "chat-status" => ack(registry.status(request.chat_id()?).await),
        "chat-snapshot" => ack(registry.snapshot(request.chat_id()?).await?),
        "mcp-toggle" => {
            let params: ToggleParams = request.params()?;
            registry
                .set_integrations(request.chat_id()?, params.enabled)
                .await?;
            ack(json!({ "enabled": params.enabled }))
        }
        "fs-list" => {
            let params: PathParams = request.params()?;
            let session = registry.get(request.chat_id()?).await?;
            let root = session.sandbox().root();
            let path = match params.path.as_deref() {
                Some(raw) if !raw.trim().is_empty() => resolve_path(root, raw)?,
                _ => root.to_path_buf(),
            };
            let mut entries = session.sandbox().list_dir(&path).await?;
            entries.retain(|entry| entry.name != "node_modules" && !entry.name.starts_with('.'));
            entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
            session.touch().await;
            ack(json!({ "path": path.to_string_lossy(), "entries": entries }))
        }
        "fs-read" => {
            let params: PathParams = request.params()?;
            let session = registry.get(request.chat_id()?).await?;
            let raw = params
                .path
                .as_deref()
                .ok_or_else(|| ChatAgentError::invalid("path is required"))?;
            let path = resolve_path(session.sandbox().root(), raw)?;
            let bytes = session.sandbox().read_file(&path).await?;
            session.touch().await;
            let is_binary = bytes.contains(&0);
            let content = if is_binary {
                base64::engine::general_purpose::STANDARD.encode(&bytes)
            } else {
                String::from_utf8_lossy(&bytes).into_owned()
            };
            ack(json!({
                "path": path.to_string_lossy(),
                "isBinary": is_binary,
                "content": content,
            }))
        }
        "fs-write" => {
            let params: WriteParams = request.params()?;
            let session = registry.get(request.chat_id()?).await?;
            let path = resolve_path(session.sandbox().root(), &params.path)?;
            session
                .sandbox()
                .write_file(&path, params.content.as_bytes())
                .await?;
            session.touch().await;
            ack(json!({ "path": path.to_string_lossy() }))
        }
        "fs-apply-patch" => {
            let params: PatchParams = request.params()?;
            let result =
                run_tool(&state, request.chat_id()?, "apply_patch", params.operation).await?;
            ack(result)
        }
        "sandbox-shell" => {
            let result = run_tool(
                &state,
                request.chat_id()?,
                "shell",
                Value::Object(request.fields.clone()),
            )
            .await?;
            ack(result)
        }
        other => {
            return Err(ChatAgentError::invalid(format!("unknown action: {other}")).into());
        }
    };
    Ok(response)
}

/// Runs one tool on behalf of the control surface, with the session's
/// sandbox and identity.
async fn run_tool(
    state: &AppState,
    chat_id: &str,
    name: &str,
    args: Value,
) -> Result<Value, ChatAgentError> {
    let session = state.registry.get(chat_id).await?;
    let context = session.turn_context().await;
    session.touch().await;
    let tool_context = ToolContext {
        chat_id: &context.chat_id,
        sandbox: context.sandbox.as_ref(),
        external_user: context.external_user.as_deref(),
        integrations_enabled: context.integrations_enabled,
    };
    state.tools.dispatch(&tool_context, name, args).await
}

async fn send_stream(state: &AppState, request: &ChatActionRequest) -> Result<Response, ApiError> {
    let chat_id = request.chat_id()?.to_string();
    let params: SendParams = request.params()?;
    let store = state.registry.store().clone();

    // The turn lock covers persisting the user message and reading history,
    // so a queued turn sees the previous turn's assistant reply.
    let (guard, context) = state.registry.begin_turn(&chat_id).await?;
    let last_user = params
        .history
        .iter()
        .rev()
        .find(|message| message.role == "user" && !message.content.trim().is_empty());
    if let Some(message) = last_user {
        let user = ChatMessage::user(message.content.clone(), params.client_message_id.clone());
        if let Err(err) = store.append_message(&chat_id, user).await {
            tracing::warn!(chat_id = %chat_id, error = %err, "failed to persist user message");
        }
    }

    let history = if params.history.is_empty() {
        store
            .load(&chat_id)
            .await?
            .map(|record| record.messages.iter().map(HistoryMessage::from).collect::<Vec<_>>())
            .unwrap_or_default()
    } else {
        params.history
    };
    if history.is_empty() {
        return Err(ChatAgentError::invalid("history is empty").into());
    }

    let provider = context.provider;
    let logs = adapters::launch_turn(
        &state.config,
        &state.tools,
        state.transport.as_ref(),
        context,
        &history,
    )
    .await?;
    tracing::info!(chat_id = %chat_id, provider = provider.as_str(), "turn started");

    let hook = persist_transcript(store, guard);
    Ok(sse_response(bridge(logs, BridgeOptions::default(), hook)))
}

/// Appends the folded assistant message, then releases the turn lock.
fn persist_transcript(store: Arc<dyn ChatStore>, guard: TurnGuard) -> CompletionHook {
    Box::new(move |outcome: BridgeOutcome| {
        async move {
            let chat_id = guard.chat_id().to_string();
            if outcome.parts.is_empty() {
                tracing::debug!(chat_id = %chat_id, "turn produced no transcript parts");
            } else if let Err(err) = store
                .append_message(&chat_id, ChatMessage::assistant(outcome.parts))
                .await
            {
                tracing::warn!(chat_id = %chat_id, error = %err, "failed to persist assistant message");
            }
            drop(guard);
        }
        .boxed()
    })
}

async fn slash_stream(state: &AppState, request: &ChatActionRequest) -> Result<Response, ApiError> {
    let chat_id = request.chat_id()?.to_string();
    let params: SlashParams = request.params()?;
    let prompt = params.prompt.trim();
    if !prompt.starts_with('/') {
        return Err(ChatAgentError::invalid("prompt must start with /").into());
    }

    let (guard, context) = state.registry.begin_turn(&chat_id).await?;
    let logs = adapters::embedded::launch(&state.config, &context, prompt, RunnerKind::Slash).await?;
    let options = BridgeOptions {
        fold_transcript: false,
        ..BridgeOptions::default()
    };
    let hook: CompletionHook = Box::new(move |_outcome| {
        async move {
            drop(guard);
        }
        .boxed()
    });
    Ok(sse_response(bridge(logs, options, hook)))
}

#[utoipa::path(
    post,
    path = "/v1/agent-tools/{tool}",
    params(("tool" = String, Path, description = "crud, workspace, drive, email, read, edit, write, delete, shell or apply-patch")),
    responses(
        (status = 200, description = "Tool result wrapped as {ok, result}"),
        (status = 401, description = "Capability token missing or not valid for x-chat-id")
    ),
    tag = "tools"
)]
async fn post_agent_tool(
    State(state): State<Arc<AppState>>,
    Path(tool): Path<String>,
    headers: HeaderMap,
    Json(args): Json<Value>,
) -> Response {
    let chat_id = headers
        .get("x-chat-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    let token = bearer_token(&headers).unwrap_or_default();
    if chat_id.is_empty() || !state.registry.verify_token(&chat_id, &token).await {
        tracing::warn!(chat_id = %chat_id, tool = %tool, "tool call rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error": "unauthorized", "code": "TOOL_UNAUTHORIZED" })),
        )
            .into_response();
    }

    match run_tool(&state, &chat_id, &tool, args).await {
        Ok(result) => Json(json!({ "ok": true, "result": result })).into_response(),
        Err(err) => {
            tracing::info!(chat_id = %chat_id, tool = %tool, error = %err, "tool call failed");
            let status = tool_status(&err);
            let failure = failure_value(&err);
            (
                status,
                Json(json!({
                    "ok": false,
                    "error": err.short_message(),
                    "code": err.error_type().tool_code(),
                    "result": failure,
                })),
            )
                .into_response()
        }
    }
}

/// Tool routes answer argument, allow-list and configuration problems with
/// a 4xx so runner scripts can tell them apart from host failures.
fn tool_status(err: &ChatAgentError) -> StatusCode {
    match err.error_type() {
        ErrorType::MissingCredential => StatusCode::FAILED_DEPENDENCY,
        other => StatusCode::from_u16(other.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path();
    // Tool callbacks carry per-session capability tokens instead.
    if path == "/v1/health"
        || path == "/health"
        || path.starts_with("/v1/agent-tools/")
        || path.starts_with("/agent-tools/")
    {
        return Ok(next.run(req).await);
    }

    let expected = match &state.auth.token {
        Some(token) => token.as_str(),
        None => return Ok(next.run(req).await),
    };

    if bearer_token(req.headers()).as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(ChatAgentError::TokenInvalid {
            message: Some("missing or invalid token".to_string()),
        }
        .into())
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = value.trim().split_once(' ')?;
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.trim().to_string()),
        _ => None,
    }
}

const SERVER_INFO: &str = "\
This is a chat-agent server. Available endpoints:\n\
  - GET  /                         - Server info\n\
  - GET  /v1/health                - Health check\n\
  - GET  /v1/openapi.json          - OpenAPI document\n\
  - POST /v1/chat                  - Chat control actions\n\
  - POST /v1/agent-tools/{tool}    - Agent tool callbacks\n";

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}
