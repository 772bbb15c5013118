//! Drive and email access, either through one scope or through the combined
//! workspace scope.

use std::sync::OnceLock;

use base64::Engine;
use chat_agent_error::ChatAgentError;
use regress::Regex;
use serde_json::{json, Map, Value};

use super::{clean_resource, str_arg, truncate_chars, BackendReply, ToolBridge, ToolContext};

const TEXT_RESPONSE_LIMIT: usize = 50_000;
const FILE_READ_LIMIT: usize = 180_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Workspace,
    Drive,
    Email,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopedAction {
    Request,
    ReadFile,
    GetDriveFileUrl,
    SendEmail,
}

impl ScopedAction {
    /// Missing actions default to `request`; `send` and `get_file_url` are
    /// shorthands.
    pub fn parse(raw: Option<&str>) -> Result<Self, ChatAgentError> {
        let raw = raw.unwrap_or("request").trim().to_ascii_lowercase();
        match raw.as_str() {
            "" | "request" => Ok(Self::Request),
            "read_file" => Ok(Self::ReadFile),
            "get_drive_file_url" | "get_file_url" => Ok(Self::GetDriveFileUrl),
            "send_email" | "send" => Ok(Self::SendEmail),
            other => Err(ChatAgentError::invalid(format!("unknown action: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::ReadFile => "read_file",
            Self::GetDriveFileUrl => "get_drive_file_url",
            Self::SendEmail => "send_email",
        }
    }
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Drive => "drive",
            Self::Email => "email",
        }
    }

    pub fn allows(&self, action: ScopedAction) -> bool {
        match self {
            Self::Workspace => true,
            Self::Drive => matches!(
                action,
                ScopedAction::Request | ScopedAction::ReadFile | ScopedAction::GetDriveFileUrl
            ),
            Self::Email => matches!(action, ScopedAction::Request | ScopedAction::SendEmail),
        }
    }

    fn rules(&self) -> Vec<&'static Rule> {
        let mut rules = Vec::new();
        if matches!(self, Self::Workspace | Self::Drive) {
            rules.extend(drive_rules());
        }
        if matches!(self, Self::Workspace | Self::Email) {
            rules.extend(email_rules());
        }
        rules
    }
}

struct Rule {
    pattern: Regex,
    methods: &'static [&'static str],
}

fn compile(table: &[(&str, &'static [&'static str])]) -> Vec<Rule> {
    table
        .iter()
        .filter_map(|&(source, methods)| {
            Regex::new(source).ok().map(|pattern| Rule { pattern, methods })
        })
        .collect()
}

const DRIVE_RULES: &[(&str, &[&str])] = &[
    ("^drive$", &["GET"]),
    ("^drive/folders$", &["GET", "POST"]),
    ("^drive/folders/[^/]+$", &["GET", "DELETE"]),
    ("^drive/files/prepare-upload$", &["POST"]),
    ("^drive/files/complete-upload$", &["POST"]),
    ("^drive/files/[^/]+$", &["DELETE"]),
    ("^drive/files/[^/]+/download$", &["GET"]),
];

const EMAIL_RULES: &[(&str, &[&str])] = &[
    ("^email/inboxes$", &["GET", "POST", "DELETE"]),
    ("^email/messages$", &["GET", "POST"]),
    ("^email/messages/[^/]+$", &["GET", "POST", "DELETE"]),
    ("^email/messages/[^/]+/attachments/[^/]+$", &["GET"]),
];

fn drive_rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| compile(DRIVE_RULES))
}

fn email_rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| compile(EMAIL_RULES))
}

fn uuid_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                "^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[1-5][0-9a-fA-F]{3}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12}$",
            )
            .ok()
        })
        .as_ref()
}

pub fn is_uuid(value: &str) -> bool {
    uuid_pattern().is_some_and(|pattern| pattern.find(value).is_some())
}

/// Checks a `request` against the scope's rules and returns the cleaned
/// resource path.
pub fn check_request(scope: Scope, method: &str, resource: &str) -> Result<String, ChatAgentError> {
    let resource = clean_resource(resource, "resource")?;
    let resource = resource.as_str();
    let mut path_matched = false;
    for rule in scope.rules() {
        if rule.pattern.find(resource).is_some() {
            path_matched = true;
            if rule.methods.contains(&method) {
                return Ok(resource.to_string());
            }
        }
    }
    let message = if path_matched {
        format!("{method} is not allowed on {resource} for {}", scope.as_str())
    } else {
        format!("resource not allowed for {}: {resource}", scope.as_str())
    };
    Err(ChatAgentError::PermissionDenied { message })
}

pub(crate) async fn call(
    bridge: &ToolBridge,
    ctx: &ToolContext<'_>,
    scope: Scope,
    args: &Value,
) -> Result<Value, ChatAgentError> {
    let action = ScopedAction::parse(str_arg(args, &["action"]))?;
    if !scope.allows(action) {
        return Err(ChatAgentError::invalid(format!(
            "action {} is not available for {}",
            action.as_str(),
            scope.as_str()
        )));
    }
    tracing::debug!(
        chat_id = ctx.chat_id,
        scope = scope.as_str(),
        action = action.as_str(),
        "scoped tool call"
    );
    match action {
        ScopedAction::Request => {
            let method = str_arg(args, &["method"])
                .unwrap_or("GET")
                .to_ascii_uppercase();
            let resource = check_request(
                scope,
                &method,
                str_arg(args, &["resource", "path"]).unwrap_or_default(),
            )?;
            let method = parse_method(&method)?;
            let reply = bridge
                .backend_request(ctx, method, &resource, args.get("params"), args.get("data"))
                .await?;
            Ok(package_reply(&reply))
        }
        ScopedAction::ReadFile => read_file(bridge, ctx, args).await,
        ScopedAction::GetDriveFileUrl => {
            let file_id = file_id(args)?;
            let reply = bridge
                .backend_request(
                    ctx,
                    reqwest::Method::GET,
                    &format!("drive/files/{file_id}/signed-url"),
                    None,
                    None,
                )
                .await?;
            Ok(package_reply(&reply))
        }
        ScopedAction::SendEmail => {
            let body = email_body(args)?;
            let resource = check_request(Scope::Email, "POST", "email/messages")?;
            let reply = bridge
                .backend_request(ctx, reqwest::Method::POST, &resource, None, Some(&body))
                .await?;
            Ok(package_reply(&reply))
        }
    }
}

fn parse_method(method: &str) -> Result<reqwest::Method, ChatAgentError> {
    method
        .parse::<reqwest::Method>()
        .map_err(|_| ChatAgentError::invalid(format!("invalid method: {method}")))
}

fn file_id(args: &Value) -> Result<&str, ChatAgentError> {
    let file_id = str_arg(args, &["file_id", "fileId"])
        .ok_or_else(|| ChatAgentError::invalid("file_id is required"))?;
    if !is_uuid(file_id) {
        return Err(ChatAgentError::invalid(format!("file_id is not a UUID: {file_id}")));
    }
    Ok(file_id)
}

/// Turns a backend reply into a tool result by content type.
pub(crate) fn package_reply(reply: &BackendReply) -> Value {
    let ok = reply.is_success();
    if reply.is_redirect() {
        return json!({
            "success": false,
            "redirectTo": reply.location,
            "status": reply.status,
        });
    }
    let content_type = reply.content_type.clone().unwrap_or_default();
    if content_type.contains("application/json") {
        let mut value = reply.json().unwrap_or_else(|| Value::Object(Map::new()));
        if !ok {
            if let Some(map) = value.as_object_mut() {
                map.entry("success").or_insert(Value::Bool(false));
                map.entry("status").or_insert(json!(reply.status));
            }
        }
        return value;
    }
    if content_type.starts_with("text/") {
        let (text, truncated) = truncate_chars(&reply.text(), TEXT_RESPONSE_LIMIT);
        return json!({
            "success": ok,
            "status": reply.status,
            "contentType": content_type,
            "text": text,
            "truncated": truncated,
        });
    }
    let content_type = if content_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        content_type
    };
    json!({
        "success": ok,
        "status": reply.status,
        "contentType": content_type,
        "sizeBytes": reply.body.len(),
        "message": "binary response; use read_file to read drive files",
    })
}

fn is_text_like(content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    content_type.starts_with("text/")
        || ["json", "xml", "csv", "javascript", "yaml", "markdown"]
            .iter()
            .any(|kind| content_type.contains(kind))
}

async fn read_file(
    bridge: &ToolBridge,
    ctx: &ToolContext<'_>,
    args: &Value,
) -> Result<Value, ChatAgentError> {
    let file_id = file_id(args)?;
    let mode = str_arg(args, &["mode"]).unwrap_or("auto").to_ascii_lowercase();
    if !matches!(mode.as_str(), "auto" | "text" | "binary") {
        return Err(ChatAgentError::invalid(format!("invalid mode: {mode}")));
    }
    let reply = bridge
        .backend_request(
            ctx,
            reqwest::Method::GET,
            &format!("drive/files/{file_id}/download"),
            None,
            None,
        )
        .await?;
    if !reply.is_success() {
        let error = reply
            .json()
            .and_then(|value| {
                value
                    .get("message")
                    .or_else(|| value.get("error"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("download failed with status {}", reply.status));
        return Ok(json!({ "success": false, "status": reply.status, "error": error }));
    }

    let content_type = reply
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let size = reply.body.len();
    let truncated = size > FILE_READ_LIMIT;
    let chunk = &reply.body[..size.min(FILE_READ_LIMIT)];
    let text_like = is_text_like(&content_type);

    if mode == "binary" {
        return Ok(json!({
            "success": true,
            "file_id": file_id,
            "contentType": content_type,
            "sizeBytes": size,
            "encoding": "base64",
            "content": base64::engine::general_purpose::STANDARD.encode(chunk),
            "truncated": truncated,
        }));
    }
    if !text_like {
        if mode == "text" {
            return Ok(json!({
                "success": false,
                "file_id": file_id,
                "contentType": content_type,
                "error": "file does not look like text; use mode=binary or mode=auto",
            }));
        }
        return Ok(json!({
            "success": true,
            "file_id": file_id,
            "contentType": content_type,
            "sizeBytes": size,
            "message": "binary file; use mode=binary for raw content",
        }));
    }
    Ok(json!({
        "success": true,
        "file_id": file_id,
        "contentType": content_type,
        "sizeBytes": size,
        "encoding": "utf-8",
        "content": String::from_utf8_lossy(chunk),
        "truncated": truncated,
    }))
}

/// Body for `POST email/messages`. Attachments come from `attachments[]`
/// entries carrying a `url` or inline `content`, plus the single
/// `attachment_url` / `signed_url` shorthand.
pub fn email_body(args: &Value) -> Result<Value, ChatAgentError> {
    let inbox_id = str_arg(args, &["inbox_id", "inboxId"])
        .ok_or_else(|| ChatAgentError::invalid("inbox_id is required for send_email"))?;
    let to = args
        .get("to")
        .filter(|value| !value.is_null())
        .ok_or_else(|| ChatAgentError::invalid("to is required for send_email"))?;

    let mut body = Map::new();
    body.insert("inboxId".to_string(), json!(inbox_id));
    body.insert("to".to_string(), to.clone());
    for key in ["cc", "bcc", "labels"] {
        if let Some(value) = args.get(key).filter(|value| !value.is_null()) {
            body.insert(key.to_string(), value.clone());
        }
    }
    for key in ["subject", "text", "html"] {
        if let Some(value) = args.get(key).and_then(Value::as_str) {
            body.insert(key.to_string(), json!(value));
        }
    }

    let mut attachments = Vec::new();
    if let Some(entries) = args.get("attachments").and_then(Value::as_array) {
        for entry in entries {
            let url = str_arg(entry, &["url"]);
            let content = entry
                .get("content")
                .and_then(Value::as_str)
                .filter(|content| !content.is_empty());
            if url.is_none() && content.is_none() {
                continue;
            }
            let mut attachment = Map::new();
            for key in ["filename", "contentType", "contentDisposition", "contentId"] {
                if let Some(value) = entry.get(key).and_then(Value::as_str) {
                    attachment.insert(key.to_string(), json!(value));
                }
            }
            if let Some(content) = content {
                attachment.insert("content".to_string(), json!(content));
            }
            if let Some(url) = url {
                attachment.insert("url".to_string(), json!(url));
            }
            attachments.push(Value::Object(attachment));
        }
    }
    if let Some(url) = str_arg(args, &["attachment_url", "signed_url"]) {
        let mut attachment = Map::new();
        for (from, to) in [
            ("filename", "filename"),
            ("content_type", "contentType"),
            ("content_disposition", "contentDisposition"),
            ("content_id", "contentId"),
        ] {
            if let Some(value) = args.get(from).and_then(Value::as_str) {
                attachment.insert(to.to_string(), json!(value));
            }
        }
        attachment.insert("url".to_string(), json!(url));
        attachments.push(Value::Object(attachment));
    }
    if !attachments.is_empty() {
        body.insert("attachments".to_string(), Value::Array(attachments));
    }
    Ok(Value::Object(body))
}
