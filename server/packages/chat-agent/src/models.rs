//! Provider and model name normalization.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-5.1";
pub const DEFAULT_CLAUDE_MODEL: &str = "claude-haiku-4-5-20251001";

const OPENAI_MODELS: &[(&str, &str)] = &[
    ("gpt-5", "gpt-5"),
    ("gpt5", "gpt-5"),
    ("gpt-5.1", "gpt-5.1"),
    ("gpt5.1", "gpt-5.1"),
    ("gpt-5.2", "gpt-5.2"),
    ("gpt5.2", "gpt-5.2"),
    ("gpt-5-mini", "gpt-5-mini"),
    ("gpt5-mini", "gpt-5-mini"),
    ("gpt5mini", "gpt-5-mini"),
    ("gpt-5-nano", "gpt-5-nano"),
    ("gpt5-nano", "gpt-5-nano"),
    ("gpt5nano", "gpt-5-nano"),
];

const CLAUDE_MODELS: &[(&str, &str)] = &[
    ("sonnet", "claude-sonnet-4-5-20251001"),
    ("sonnet-4.5", "claude-sonnet-4-5-20251001"),
    ("claude-sonnet-4-5-20251001", "claude-sonnet-4-5-20251001"),
    ("haiku", "claude-haiku-4-5-20251001"),
    ("haiku-4.5", "claude-haiku-4-5-20251001"),
    ("claude-haiku-4-5-20251001", "claude-haiku-4-5-20251001"),
];

/// Which turn loop drives a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, ToSchema)]
pub enum Provider {
    /// Loop embedded in a runner script inside the sandbox.
    #[serde(rename = "claude-agent")]
    ClaudeAgent,
    /// Loop driven from the host against a Responses-style API.
    #[serde(rename = "openai-responses")]
    OpenAiResponses,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeAgent => "claude-agent",
            Self::OpenAiResponses => "openai-responses",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::ClaudeAgent => DEFAULT_CLAUDE_MODEL,
            Self::OpenAiResponses => DEFAULT_OPENAI_MODEL,
        }
    }
}

fn infer_provider(model: Option<&str>) -> Provider {
    let raw = model.unwrap_or_default().trim().to_ascii_lowercase();
    if raw.is_empty() {
        return Provider::ClaudeAgent;
    }
    let openai_prefix = ["gpt-", "o1", "o3", "o4"]
        .iter()
        .any(|prefix| raw.starts_with(prefix));
    if openai_prefix || raw.contains("gpt") || raw.contains("openai") {
        Provider::OpenAiResponses
    } else {
        Provider::ClaudeAgent
    }
}

/// Resolves an explicit provider alias, falling back to inference from the
/// model name.
pub fn normalize_provider(provider: Option<&str>, model: Option<&str>) -> Provider {
    match provider
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "openai" | "openai-responses" | "responses" => Provider::OpenAiResponses,
        "claude" | "claude-agent" | "anthropic" => Provider::ClaudeAgent,
        _ => infer_provider(model),
    }
}

pub fn normalize_model(provider: Provider, model: Option<&str>) -> String {
    let raw = model.unwrap_or_default().trim().to_ascii_lowercase();
    let table = match provider {
        Provider::OpenAiResponses => OPENAI_MODELS,
        Provider::ClaudeAgent => CLAUDE_MODELS,
    };
    table
        .iter()
        .find(|(alias, _)| *alias == raw)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or_else(|| provider.default_model().to_string())
}

/// Models that execute shell commands natively get the built-in shell tool
/// instead of the function-call variant.
pub fn supports_native_shell(model: &str) -> bool {
    model.starts_with("gpt-5.1") || model.starts_with("gpt-5.2")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_provider_aliases_win() {
        assert_eq!(normalize_provider(Some("Responses"), Some("sonnet")), Provider::OpenAiResponses);
        assert_eq!(normalize_provider(Some("anthropic"), Some("gpt-5")), Provider::ClaudeAgent);
    }

    #[test]
    fn provider_is_inferred_from_model() {
        assert_eq!(normalize_provider(None, Some("gpt5mini")), Provider::OpenAiResponses);
        assert_eq!(normalize_provider(Some("unknown"), Some("o3-mini")), Provider::OpenAiResponses);
        assert_eq!(normalize_provider(None, Some("haiku")), Provider::ClaudeAgent);
        assert_eq!(normalize_provider(None, None), Provider::ClaudeAgent);
    }

    #[test]
    fn models_map_to_canonical_ids_with_safe_defaults() {
        assert_eq!(normalize_model(Provider::OpenAiResponses, Some(" GPT5.2 ")), "gpt-5.2");
        assert_eq!(normalize_model(Provider::OpenAiResponses, Some("gpt-4o")), DEFAULT_OPENAI_MODEL);
        assert_eq!(
            normalize_model(Provider::ClaudeAgent, Some("sonnet-4.5")),
            "claude-sonnet-4-5-20251001"
        );
        assert_eq!(normalize_model(Provider::ClaudeAgent, None), DEFAULT_CLAUDE_MODEL);
    }

    #[test]
    fn native_shell_detection() {
        assert!(supports_native_shell("gpt-5.1"));
        assert!(supports_native_shell("gpt-5.2"));
        assert!(!supports_native_shell("gpt-5-mini"));
    }
}
