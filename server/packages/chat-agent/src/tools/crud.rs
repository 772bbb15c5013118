//! Generic ERP record access on a fixed set of resource prefixes.

use chat_agent_error::ChatAgentError;
use serde_json::{json, Map, Value};

use super::{clean_resource, str_arg, BackendReply, ToolBridge, ToolContext};

pub const ALLOWED_PREFIXES: &[&str] = &[
    "financeiro",
    "vendas",
    "compras",
    "contas-a-pagar",
    "contas-a-receber",
    "crm",
    "estoque",
    "cadastros",
    "documentos",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrudAction {
    List,
    Create,
    Update,
    Delete,
}

impl CrudAction {
    /// Accepts the English names and the Portuguese ones the backend routes use.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "list" | "listar" => Some(Self::List),
            "create" | "criar" => Some(Self::Create),
            "update" | "atualizar" => Some(Self::Update),
            "delete" | "deletar" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::List => "listar",
            Self::Create => "criar",
            Self::Update => "atualizar",
            Self::Delete => "deletar",
        }
    }

    /// Route suffixes tried in order when the caller names none. Update and
    /// delete routes are not named consistently across backend modules.
    pub fn default_suffixes(&self) -> &'static [&'static str] {
        match self {
            Self::List => &["listar"],
            Self::Create => &["criar"],
            Self::Update => &["atualizar", "editar", "update", "edit"],
            Self::Delete => &["deletar", "delete"],
        }
    }
}

/// Normalizes `resource` and checks it against [`ALLOWED_PREFIXES`].
pub fn validate_resource(raw: &str) -> Result<String, ChatAgentError> {
    let resource = clean_resource(raw, "resource")?;
    let allowed = ALLOWED_PREFIXES.iter().any(|prefix| {
        resource == *prefix
            || resource
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    });
    if !allowed {
        return Err(ChatAgentError::PermissionDenied {
            message: format!("resource not allowed: {resource}"),
        });
    }
    Ok(resource)
}

pub(crate) async fn call(
    bridge: &ToolBridge,
    ctx: &ToolContext<'_>,
    args: &Value,
) -> Result<Value, ChatAgentError> {
    let raw_action = str_arg(args, &["action"]).unwrap_or_default();
    let action = CrudAction::parse(raw_action)
        .ok_or_else(|| ChatAgentError::invalid(format!("unknown crud action: {raw_action}")))?;
    let resource = validate_resource(str_arg(args, &["resource", "path"]).unwrap_or_default())?;
    let suffixes: Vec<String> = match str_arg(args, &["suffix", "actionSuffix"]) {
        Some(suffix) => vec![clean_resource(suffix, "suffix")?],
        None => action
            .default_suffixes()
            .iter()
            .map(|suffix| suffix.to_string())
            .collect(),
    };
    let method = match str_arg(args, &["method"]) {
        Some(method) => method
            .to_ascii_uppercase()
            .parse::<reqwest::Method>()
            .map_err(|_| ChatAgentError::invalid(format!("invalid method: {method}")))?,
        None => reqwest::Method::POST,
    };

    let empty = Value::Object(Map::new());
    let payload = match action {
        CrudAction::List => args.get("params"),
        _ => args.get("data"),
    }
    .filter(|value| !value.is_null())
    .unwrap_or(&empty);

    let mut reply: Option<BackendReply> = None;
    for suffix in &suffixes {
        let path = format!("{resource}/{suffix}");
        let attempt = if method == reqwest::Method::GET {
            bridge
                .backend_request(ctx, method.clone(), &path, Some(payload), None)
                .await?
        } else {
            bridge
                .backend_request(ctx, method.clone(), &path, None, Some(payload))
                .await?
        };
        if attempt.is_success() {
            reply = Some(attempt);
            break;
        }
        // A route that exists and refused says more than one that is missing.
        if reply.as_ref().map_or(true, |previous| previous.status == 404) {
            reply = Some(attempt);
        }
    }
    let Some(reply) = reply else {
        return Err(ChatAgentError::invalid("no crud route to call"));
    };

    let parsed = reply.json();
    let out = match parsed {
        Some(Value::Object(mut map)) if map.contains_key("result") => {
            map.remove("result").unwrap_or(Value::Null)
        }
        Some(value) => value,
        None => Value::Object(Map::new()),
    };
    if !reply.is_success() {
        let error = out
            .get("error")
            .or_else(|| out.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| {
                let text = reply.text();
                if text.trim().is_empty() {
                    format!("crud request failed with status {}", reply.status)
                } else {
                    text
                }
            });
        return Ok(json!({ "success": false, "status": reply.status, "error": error }));
    }
    Ok(out)
}
