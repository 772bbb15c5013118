use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    Conflict,
    TokenInvalid,
    PermissionDenied,
    SessionNotFound,
    FileNotFound,
    ProvisionFailed,
    SandboxFailed,
    MissingCredential,
    PatchFailed,
    UpstreamError,
    StreamError,
    StorageError,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:chat-agent:error:invalid_request",
            Self::Conflict => "urn:chat-agent:error:conflict",
            Self::TokenInvalid => "urn:chat-agent:error:token_invalid",
            Self::PermissionDenied => "urn:chat-agent:error:permission_denied",
            Self::SessionNotFound => "urn:chat-agent:error:session_not_found",
            Self::FileNotFound => "urn:chat-agent:error:file_not_found",
            Self::ProvisionFailed => "urn:chat-agent:error:provision_failed",
            Self::SandboxFailed => "urn:chat-agent:error:sandbox_failed",
            Self::MissingCredential => "urn:chat-agent:error:missing_credential",
            Self::PatchFailed => "urn:chat-agent:error:patch_failed",
            Self::UpstreamError => "urn:chat-agent:error:upstream_error",
            Self::StreamError => "urn:chat-agent:error:stream_error",
            Self::StorageError => "urn:chat-agent:error:storage_error",
            Self::Timeout => "urn:chat-agent:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::Conflict => "Conflict",
            Self::TokenInvalid => "Token Invalid",
            Self::PermissionDenied => "Permission Denied",
            Self::SessionNotFound => "Session Not Found",
            Self::FileNotFound => "File Not Found",
            Self::ProvisionFailed => "Provision Failed",
            Self::SandboxFailed => "Sandbox Failed",
            Self::MissingCredential => "Missing Credential",
            Self::PatchFailed => "Patch Failed",
            Self::UpstreamError => "Upstream Error",
            Self::StreamError => "Stream Error",
            Self::StorageError => "Storage Error",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Conflict => 409,
            Self::TokenInvalid => 401,
            Self::PermissionDenied => 403,
            Self::SessionNotFound => 404,
            Self::FileNotFound => 404,
            Self::ProvisionFailed => 500,
            Self::SandboxFailed => 502,
            Self::MissingCredential => 500,
            Self::PatchFailed => 422,
            Self::UpstreamError => 502,
            Self::StreamError => 502,
            Self::StorageError => 500,
            Self::Timeout => 504,
        }
    }

    /// Stable machine-readable code used in tool results.
    pub fn tool_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "TOOL_ARGUMENTS_INVALID",
            Self::TokenInvalid => "TOOL_UNAUTHORIZED",
            Self::PermissionDenied => "TOOL_FORBIDDEN",
            Self::FileNotFound => "TOOL_FILE_NOT_FOUND",
            Self::MissingCredential => "TOOL_NOT_CONFIGURED",
            Self::PatchFailed => "TOOL_PATCH_FAILED",
            Self::UpstreamError => "TOOL_UPSTREAM_ERROR",
            Self::Timeout => "TOOL_TIMEOUT",
            _ => "TOOL_HANDLER_ERROR",
        }
    }
}

/// RFC 7807 problem document returned by every failing HTTP handler.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub type_: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Error)]
pub enum ChatAgentError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },
    #[error("session not found: {chat_id}")]
    SessionNotFound { chat_id: String },
    #[error("file not found: {path}")]
    FileNotFound { path: String },
    #[error("provisioning failed at {stage}")]
    ProvisionFailed {
        stage: String,
        exit_code: Option<i32>,
        stdout: Option<String>,
        stderr: Option<String>,
    },
    #[error("sandbox operation failed: {message}")]
    SandboxFailed { message: String },
    #[error("missing credential: {name}")]
    MissingCredential { name: String },
    #[error("patch failed: {message}")]
    PatchFailed { message: String },
    #[error("upstream error: {message}")]
    UpstreamError {
        message: String,
        status: Option<u16>,
    },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("storage error: {message}")]
    StorageError { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
}

fn message_details(message: &str) -> Value {
    let mut map = Map::new();
    map.insert("message".to_string(), Value::String(message.to_string()));
    Value::Object(map)
}

impl ChatAgentError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::SandboxFailed {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::Conflict { .. } => ErrorType::Conflict,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::PermissionDenied { .. } => ErrorType::PermissionDenied,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::FileNotFound { .. } => ErrorType::FileNotFound,
            Self::ProvisionFailed { .. } => ErrorType::ProvisionFailed,
            Self::SandboxFailed { .. } => ErrorType::SandboxFailed,
            Self::MissingCredential { .. } => ErrorType::MissingCredential,
            Self::PatchFailed { .. } => ErrorType::PatchFailed,
            Self::UpstreamError { .. } => ErrorType::UpstreamError,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::StorageError { .. } => ErrorType::StorageError,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    /// Message without the taxonomy prefix, suitable for tool results.
    pub fn short_message(&self) -> String {
        match self {
            Self::InvalidRequest { message }
            | Self::Conflict { message }
            | Self::PermissionDenied { message }
            | Self::SandboxFailed { message }
            | Self::PatchFailed { message }
            | Self::UpstreamError { message, .. }
            | Self::StreamError { message }
            | Self::StorageError { message } => message.clone(),
            Self::TokenInvalid { message } | Self::Timeout { message } => {
                message.clone().unwrap_or_else(|| self.to_string())
            }
            _ => self.to_string(),
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        let (chat_id, details) = match self {
            Self::InvalidRequest { .. } => (None, None),
            Self::Conflict { message }
            | Self::SandboxFailed { message }
            | Self::PatchFailed { message }
            | Self::StreamError { message }
            | Self::StorageError { message } => (None, Some(message_details(message))),
            Self::PermissionDenied { message } => (None, Some(message_details(message))),
            Self::TokenInvalid { message } | Self::Timeout { message } => {
                (None, message.as_deref().map(message_details))
            }
            Self::SessionNotFound { chat_id } => (Some(chat_id.clone()), None),
            Self::FileNotFound { path } => {
                let mut map = Map::new();
                map.insert("path".to_string(), Value::String(path.clone()));
                (None, Some(Value::Object(map)))
            }
            Self::ProvisionFailed {
                stage,
                exit_code,
                stdout,
                stderr,
            } => {
                let mut map = Map::new();
                map.insert("stage".to_string(), Value::String(stage.clone()));
                if let Some(code) = exit_code {
                    map.insert(
                        "exitCode".to_string(),
                        Value::Number(serde_json::Number::from(*code as i64)),
                    );
                }
                if let Some(stdout) = stdout {
                    map.insert("stdout".to_string(), Value::String(stdout.clone()));
                }
                if let Some(stderr) = stderr {
                    map.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
                (None, Some(Value::Object(map)))
            }
            Self::MissingCredential { name } => {
                let mut map = Map::new();
                map.insert("credential".to_string(), Value::String(name.clone()));
                (None, Some(Value::Object(map)))
            }
            Self::UpstreamError { message, status } => {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(message.clone()));
                if let Some(status) = status {
                    map.insert(
                        "status".to_string(),
                        Value::Number(serde_json::Number::from(*status)),
                    );
                }
                (None, Some(Value::Object(map)))
            }
        };

        ErrorInfo {
            type_: self.error_type(),
            message: self.to_string(),
            chat_id,
            details,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let info = self.to_error_info();

        let mut extensions = Map::new();
        if let Some(chat_id) = info.chat_id {
            extensions.insert("chatId".to_string(), Value::String(chat_id));
        }
        if let Some(details) = info.details {
            extensions.insert("details".to_string(), details);
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<ChatAgentError> for ProblemDetails {
    fn from(value: ChatAgentError) -> Self {
        value.to_problem_details()
    }
}

impl From<&ChatAgentError> for ProblemDetails {
    fn from(value: &ChatAgentError) -> Self {
        value.to_problem_details()
    }
}

impl From<ChatAgentError> for ErrorInfo {
    fn from(value: ChatAgentError) -> Self {
        value.to_error_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_failure_carries_captured_output() {
        let err = ChatAgentError::ProvisionFailed {
            stage: "install".to_string(),
            exit_code: Some(1),
            stdout: Some("added 0 packages".to_string()),
            stderr: Some("npm ERR! 404".to_string()),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 500);
        assert_eq!(problem.type_, "urn:chat-agent:error:provision_failed");
        let details = problem.extensions.get("details").expect("details");
        assert_eq!(details["exitCode"], 1);
        assert_eq!(details["stderr"], "npm ERR! 404");
    }

    #[test]
    fn session_not_found_exposes_chat_id() {
        let problem: ProblemDetails = ChatAgentError::SessionNotFound {
            chat_id: "abc".to_string(),
        }
        .into();
        assert_eq!(problem.status, 404);
        assert_eq!(problem.extensions.get("chatId"), Some(&Value::from("abc")));
    }

    #[test]
    fn short_message_drops_prefix() {
        let err = ChatAgentError::invalid("old_string is required");
        assert_eq!(err.short_message(), "old_string is required");
        assert_eq!(err.error_type().tool_code(), "TOOL_ARGUMENTS_INVALID");
    }
}
