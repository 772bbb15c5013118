//! Prompt composition for both adapters.

use serde::Deserialize;

use crate::models::Provider;
use crate::store::{ChatMessage, ChatRole};

/// Character budget for the embedded runner prompt.
pub const EMBEDDED_PROMPT_BUDGET: usize = 6000;
/// Character budget for the host-driven Responses prompt.
pub const RESPONSES_PROMPT_BUDGET: usize = 9000;

const ERP_PREFIXES: &str =
    "financeiro, vendas, compras, contas-a-pagar, contas-a-receber, crm, estoque, cadastros, documentos";

/// A message as the chat UI sends it with each turn.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl From<&ChatMessage> for HistoryMessage {
    fn from(message: &ChatMessage) -> Self {
        let role = match message.role {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::System => "system",
        };
        Self {
            role: role.to_string(),
            content: message.content.clone(),
        }
    }
}

fn preamble(provider: Provider, integrations_enabled: bool) -> String {
    let mut text = String::from(
        "You are an operations assistant working inside a sandboxed workspace.\n\
         Use tools whenever live data or side effects are needed; never invent resources, ids or results.\n",
    );
    text.push_str(&format!(
        "ERP access goes through the crud tool. Allowed resource prefixes: {ERP_PREFIXES}. \
         Resources never contain \"..\".\n"
    ));
    match provider {
        Provider::OpenAiResponses => text.push_str(
            "Workspace files are handled with Read, Edit, Write, Delete and apply_patch; run commands with shell.\n",
        ),
        Provider::ClaudeAgent => text.push_str(
            "Workspace files live under the current directory; prefer editing over rewriting whole files.\n",
        ),
    }
    if integrations_enabled {
        text.push_str(
            "External integrations are enabled; use them only when the user asks for an external action.\n\
             Drive and email requests go through the drive and email tools; send email with inbox_id and to.\n",
        );
    }
    text.push_str("Before each tool call, say briefly what you are about to do. Keep final answers short.\n");
    text
}

fn render(message: &HistoryMessage) -> Option<String> {
    let content = message.content.trim();
    if content.is_empty() {
        return None;
    }
    let label = match message.role.as_str() {
        "user" => "User",
        "assistant" => "Assistant",
        _ => return None,
    };
    Some(format!("{label}: {content}"))
}

/// Builds the turn prompt: the preamble followed by as many of the most recent
/// history messages as fit in `budget` characters, oldest first.
pub fn compose(
    provider: Provider,
    integrations_enabled: bool,
    history: &[HistoryMessage],
    budget: usize,
) -> String {
    let preamble = preamble(provider, integrations_enabled);
    let mut remaining = budget.saturating_sub(preamble.chars().count() + 1);
    let mut kept = Vec::new();
    for line in history.iter().rev().filter_map(render) {
        let cost = line.chars().count() + 1;
        if cost > remaining {
            if kept.is_empty() && remaining > 0 {
                // The latest message alone is too long; keep its head.
                kept.push(line.chars().take(remaining - 1).collect());
            }
            break;
        }
        remaining -= cost;
        kept.push(line);
    }
    kept.reverse();

    let mut prompt = preamble;
    if !kept.is_empty() {
        prompt.push('\n');
        prompt.push_str(&kept.join("\n"));
    }
    prompt
}

pub fn budget_for(provider: Provider) -> usize {
    match provider {
        Provider::ClaudeAgent => EMBEDDED_PROMPT_BUDGET,
        Provider::OpenAiResponses => RESPONSES_PROMPT_BUDGET,
    }
}
