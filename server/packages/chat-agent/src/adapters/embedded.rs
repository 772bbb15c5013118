//! Launches the runner script that drives the whole turn from inside the
//! sandbox.

use chat_agent_error::ChatAgentError;

use crate::config::BridgeConfig;
use crate::registry::TurnContext;
use crate::sandbox::{CommandSpec, LogReceiver};

const CHAT_RUNNER: &str = include_str!("../../runners/agent-chat-stream.mjs");
const SLASH_RUNNER: &str = include_str!("../../runners/agent-slash-stream.mjs");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Chat,
    Slash,
}

impl RunnerKind {
    fn file_name(&self) -> &'static str {
        match self {
            Self::Chat => "agent-chat-stream.mjs",
            Self::Slash => "agent-slash-stream.mjs",
        }
    }

    fn script(&self) -> &'static str {
        match self {
            Self::Chat => CHAT_RUNNER,
            Self::Slash => SLASH_RUNNER,
        }
    }
}

/// Writes the runner into the sandbox root and starts it detached. The
/// returned channel carries its stdout lines as turn events.
pub async fn launch(
    config: &BridgeConfig,
    context: &TurnContext,
    prompt: &str,
    kind: RunnerKind,
) -> Result<LogReceiver, ChatAgentError> {
    let api_key = config
        .anthropic_api_key
        .as_deref()
        .ok_or_else(|| ChatAgentError::MissingCredential {
            name: "ANTHROPIC_API_KEY".to_string(),
        })?;

    let root = context.sandbox.root();
    let script_path = root.join(kind.file_name());
    context
        .sandbox
        .write_file(&script_path, kind.script().as_bytes())
        .await?;

    let mut command = CommandSpec::new(config.runner_program.clone())
        .arg(script_path.to_string_lossy())
        .cwd(root)
        .env("ANTHROPIC_API_KEY", api_key)
        .env("AGENT_MODEL", context.model.clone())
        .env("AGENT_TOOL_TOKEN", context.token.clone())
        .env("AGENT_CHAT_ID", context.chat_id.clone())
        .env("AGENT_BASE_URL", config.public_url.clone())
        .env(
            "AGENT_INTEGRATIONS_ENABLED",
            if context.integrations_enabled { "1" } else { "0" },
        )
        .env("AGENT_PROMPT", prompt);
    if let Some(user) = context.external_user.as_deref() {
        command = command.env("AGENT_USER_ID", user);
    }

    tracing::info!(
        chat_id = %context.chat_id,
        sandbox_id = context.sandbox.id(),
        runner = kind.file_name(),
        model = %context.model,
        "launching embedded runner"
    );
    context
        .sandbox
        .spawn_detached(command, config.log_channel_capacity)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::Provider;
    use crate::sandbox::{LocalSandboxProvider, LogChunk, SandboxProvider};

    async fn context(dir: &std::path::Path) -> TurnContext {
        let provider = LocalSandboxProvider::new(dir).unwrap();
        TurnContext {
            chat_id: "chat-1".into(),
            sandbox: provider.create().await.unwrap(),
            token: "tok".into(),
            provider: Provider::ClaudeAgent,
            model: "claude-haiku-4-5-20251001".into(),
            integrations_enabled: false,
            external_user: None,
        }
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(dir.path()).await;
        let err = launch(&BridgeConfig::default(), &context, "hi", RunnerKind::Chat)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatAgentError::MissingCredential { .. }));
        assert!(!context.sandbox.root().join("agent-chat-stream.mjs").exists());
    }

    #[tokio::test]
    async fn writes_runner_and_streams_its_output() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(dir.path()).await;
        let config = BridgeConfig {
            anthropic_api_key: Some("sk-test".into()),
            runner_program: "cat".into(),
            ..BridgeConfig::default()
        };
        let mut logs = launch(&config, &context, "hi", RunnerKind::Slash).await.unwrap();
        let mut stdout = String::new();
        while let Some(chunk) = logs.recv().await {
            if let LogChunk::Stdout(text) = chunk {
                stdout.push_str(&text);
            }
        }
        assert_eq!(stdout, SLASH_RUNNER);
        context.sandbox.stop().await.unwrap();
    }

    #[test]
    fn chat_runner_registers_integration_tools_only_when_enabled() {
        assert!(CHAT_RUNNER.contains("env.AGENT_INTEGRATIONS_ENABLED === '1'"));
        assert!(CHAT_RUNNER
            .contains("integrationsEnabled ? [...erpTools, ...integrationTools] : erpTools"));
        for name in crate::tools::INTEGRATION_TOOLS {
            assert!(CHAT_RUNNER.contains(&format!("tool('{name}'")), "{name}");
        }
    }
}
