//! Tool Bridge: the calls an agent may make back into the host.
//!
//! Every tool is reachable two ways. Adapter B dispatches in-process through
//! [`ToolBridge::dispatch`]; the embedded runner scripts post to
//! `/v1/agent-tools/*`, which ends up in the same function. Argument,
//! allow-list and credential failures come back as `Err` so both surfaces can
//! render them as `{success: false, error, code}`.

pub mod crud;
mod files;
mod shell;
pub mod workspace;

use std::time::Duration;

use chat_agent_error::ChatAgentError;
use serde_json::{json, Map, Value};

use crate::config::BridgeConfig;
use crate::sandbox::Sandbox;

pub use crud::CrudAction;
pub use workspace::Scope;

const BACKEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Caller identity for one tool call.
#[derive(Debug, Clone, Copy)]
pub struct ToolContext<'a> {
    pub chat_id: &'a str,
    pub sandbox: &'a dyn Sandbox,
    pub external_user: Option<&'a str>,
    /// Gates the drive, email and workspace tools.
    pub integrations_enabled: bool,
}

/// Tools that reach integrations outside the ERP.
pub const INTEGRATION_TOOLS: &[&str] = &["workspace", "drive", "email"];

#[derive(Debug, Clone)]
pub struct ToolBridge {
    client: reqwest::Client,
    backend_url: Option<String>,
    backend_token: Option<String>,
}

/// Raw answer from the host backend.
#[derive(Debug, Clone)]
pub(crate) struct BackendReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub location: Option<String>,
    pub body: Vec<u8>,
}

impl BackendReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl ToolBridge {
    pub fn new(backend_url: Option<String>, backend_token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(BACKEND_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            backend_url: backend_url
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            backend_token,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.backend_url.clone(), config.backend_token.clone())
    }

    /// Runs one tool by name. Tool names are matched the way providers send
    /// them, so `Read` and `read` are the same tool.
    pub async fn dispatch(
        &self,
        ctx: &ToolContext<'_>,
        name: &str,
        args: Value,
    ) -> Result<Value, ChatAgentError> {
        if !args.is_object() && !args.is_null() {
            return Err(ChatAgentError::invalid(format!(
                "arguments for {name} must be a JSON object"
            )));
        }
        if INTEGRATION_TOOLS.contains(&name) && !ctx.integrations_enabled {
            return Err(ChatAgentError::PermissionDenied {
                message: format!("{name} needs integrations enabled for this chat"),
            });
        }
        match name {
            "crud" => crud::call(self, ctx, &args).await,
            "workspace" => workspace::call(self, ctx, Scope::Workspace, &args).await,
            "drive" => workspace::call(self, ctx, Scope::Drive, &args).await,
            "email" => workspace::call(self, ctx, Scope::Email, &args).await,
            "Read" | "read" => files::read(ctx, &args).await,
            "Edit" | "edit" => files::edit(ctx, &args).await,
            "Write" | "write" => files::write(ctx, &args).await,
            "Delete" | "delete" => files::delete(ctx, &args).await,
            "shell" => shell::call(ctx, &args).await,
            "apply_patch" | "apply-patch" => files::apply_patch(ctx, &args).await,
            other => Err(ChatAgentError::invalid(format!("unknown tool: {other}"))),
        }
    }

    fn backend_url(&self) -> Result<&str, ChatAgentError> {
        self.backend_url
            .as_deref()
            .ok_or_else(|| ChatAgentError::MissingCredential {
                name: "CHAT_AGENT_BACKEND_URL".to_string(),
            })
    }

    /// Sends one request to `{backend}/{path}`. GET requests carry `params`
    /// as the query string; everything else sends `body` as JSON.
    pub(crate) async fn backend_request(
        &self,
        ctx: &ToolContext<'_>,
        method: reqwest::Method,
        path: &str,
        params: Option<&Value>,
        body: Option<&Value>,
    ) -> Result<BackendReply, ChatAgentError> {
        let mut url = reqwest::Url::parse(self.backend_url()?).map_err(|err| {
            ChatAgentError::invalid(format!("invalid backend url: {err}"))
        })?;
        url.path_segments_mut()
            .map_err(|_| ChatAgentError::invalid("backend url cannot carry a path"))?
            .pop_if_empty()
            .extend(path.split('/').filter(|segment| !segment.is_empty()));
        let mut request = self
            .client
            .request(method.clone(), url)
            .header("x-chat-id", ctx.chat_id);
        if let Some(token) = self.backend_token.as_deref() {
            request = request.bearer_auth(token);
        }
        if let Some(user) = ctx.external_user {
            request = request.header("x-user-id", user);
        }
        if let Some(params) = params {
            let pairs = query_pairs(params);
            if !pairs.is_empty() {
                request = request.query(&pairs);
            }
        }
        if method != reqwest::Method::GET {
            request = request.json(body.unwrap_or(&Value::Object(Map::new())));
        }

        let response = request.send().await.map_err(|err| ChatAgentError::UpstreamError {
            message: format!("backend request failed: {err}"),
            status: None,
        })?;
        let status = response.status().as_u16();
        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(reqwest::header::CONTENT_TYPE);
        let location = header(reqwest::header::LOCATION);
        let body = response
            .bytes()
            .await
            .map_err(|err| ChatAgentError::UpstreamError {
                message: format!("failed to read backend response: {err}"),
                status: Some(status),
            })?
            .to_vec();
        tracing::debug!(chat_id = ctx.chat_id, %method, path, status, "backend request");
        Ok(BackendReply {
            status,
            content_type,
            location,
            body,
        })
    }
}

/// Tool-result shape for an error that stopped a call.
pub fn failure_value(err: &ChatAgentError) -> Value {
    json!({
        "success": false,
        "error": err.short_message(),
        "code": err.error_type().tool_code(),
    })
}

/// Arrays repeat the key; nested objects are sent as JSON text.
fn query_pairs(params: &Value) -> Vec<(String, String)> {
    let Some(map) = params.as_object() else {
        return Vec::new();
    };
    let render = |value: &Value| match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let mut pairs = Vec::new();
    for (key, value) in map {
        match value {
            Value::Null => {}
            Value::Array(items) => pairs.extend(
                items
                    .iter()
                    .filter(|item| !item.is_null())
                    .map(|item| (key.clone(), render(item))),
            ),
            other => pairs.push((key.clone(), render(other))),
        }
    }
    pairs
}

/// Trims a backend resource path and rejects anything that could leave the
/// path it names once the URL is normalized: dot segments, empty segments,
/// percent escapes, backslashes and query or fragment markers.
pub(crate) fn clean_resource(raw: &str, what: &str) -> Result<String, ChatAgentError> {
    let resource = raw.trim().trim_matches('/');
    if resource.is_empty() {
        return Err(ChatAgentError::invalid(format!("{what} is required")));
    }
    let bad_char = resource
        .chars()
        .any(|ch| matches!(ch, '%' | '\\' | '?' | '#') || ch.is_control());
    let bad_segment = resource
        .split('/')
        .any(|segment| matches!(segment.trim(), "" | "." | ".."));
    if bad_char || bad_segment {
        return Err(ChatAgentError::invalid(format!("invalid {what}: {resource}")));
    }
    Ok(resource.to_string())
}

pub(crate) fn str_arg<'a>(args: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| args.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
}

pub(crate) fn required_str<'a>(
    args: &'a Value,
    keys: &[&str],
    tool: &str,
) -> Result<&'a str, ChatAgentError> {
    str_arg(args, keys)
        .ok_or_else(|| ChatAgentError::invalid(format!("{} is required for {tool}", keys[0])))
}

/// Positive integer argument. Strings holding digits are accepted too.
pub(crate) fn positive_int(args: &Value, key: &str) -> Option<usize> {
    match args.get(key)? {
        Value::Number(number) => number
            .as_f64()
            .filter(|value| value.is_finite() && *value >= 1.0)
            .map(|value| value.floor() as usize),
        Value::String(text) => text.trim().parse::<usize>().ok().filter(|value| *value > 0),
        _ => None,
    }
}

/// Cuts `text` to at most `limit` characters.
pub(crate) fn truncate_chars(text: &str, limit: usize) -> (String, bool) {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => (text[..cut].to_string(), true),
        None => (text.to_string(), false),
    }
}
