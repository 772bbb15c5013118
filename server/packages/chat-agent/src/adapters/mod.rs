//! Provider adapters. Both produce the same turn-event log stream.

pub mod embedded;
pub mod responses;

use std::sync::Arc;

use chat_agent_error::ChatAgentError;

use crate::config::BridgeConfig;
use crate::models::Provider;
use crate::prompt::{budget_for, compose, HistoryMessage};
use crate::registry::TurnContext;
use crate::sandbox::LogReceiver;
use crate::tools::ToolBridge;

pub use embedded::RunnerKind;
pub use responses::{HttpResponsesTransport, ResponsesSettings, ResponsesTransport, ResponsesTurn};

/// Starts one turn on the adapter matching the session's provider.
///
/// Credential checks happen here, before any stream exists, so callers can
/// still answer with a plain error response.
pub async fn launch_turn(
    config: &BridgeConfig,
    tools: &Arc<ToolBridge>,
    transport: Option<&Arc<dyn ResponsesTransport>>,
    context: TurnContext,
    history: &[HistoryMessage],
) -> Result<LogReceiver, ChatAgentError> {
    let prompt = compose(
        context.provider,
        context.integrations_enabled,
        history,
        budget_for(context.provider),
    );
    match context.provider {
        Provider::ClaudeAgent => {
            embedded::launch(config, &context, &prompt, RunnerKind::Chat).await
        }
        Provider::OpenAiResponses => {
            let transport = transport.ok_or_else(|| ChatAgentError::MissingCredential {
                name: "OPENAI_API_KEY".to_string(),
            })?;
            let turn = ResponsesTurn {
                settings: ResponsesSettings {
                    max_turns: config.max_turns,
                    reasoning_effort: config.reasoning_effort.clone(),
                },
                transport: transport.clone(),
                tools: tools.clone(),
                context,
                prompt,
            };
            Ok(turn.spawn(config.log_channel_capacity))
        }
    }
}
