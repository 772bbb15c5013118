/// Runtime settings shared by the adapters and the tool bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Base URL the runner scripts use to reach this server's tool routes.
    pub public_url: String,
    /// Base URL of the host application's ERP, drive and email APIs.
    pub backend_url: Option<String>,
    pub backend_token: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    /// Ceiling on provider round-trips per Responses turn.
    pub max_turns: usize,
    pub reasoning_effort: String,
    pub log_channel_capacity: usize,
    /// Interpreter used to launch the embedded runner scripts.
    pub runner_program: String,
}

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MAX_TURNS: usize = 10;
pub const DEFAULT_LOG_CHANNEL_CAPACITY: usize = 256;

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            public_url: "http://127.0.0.1:2468".to_string(),
            backend_url: None,
            backend_token: None,
            anthropic_api_key: None,
            openai_api_key: None,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            max_turns: DEFAULT_MAX_TURNS,
            reasoning_effort: "medium".to_string(),
            log_channel_capacity: DEFAULT_LOG_CHANNEL_CAPACITY,
            runner_program: "node".to_string(),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl BridgeConfig {
    /// Fills credentials and base URLs from the process environment.
    pub fn with_env(mut self) -> Self {
        self.anthropic_api_key = non_empty_env("ANTHROPIC_API_KEY").or(self.anthropic_api_key);
        self.openai_api_key = non_empty_env("OPENAI_API_KEY").or(self.openai_api_key);
        if let Some(url) = non_empty_env("OPENAI_BASE_URL") {
            self.openai_base_url = url;
        }
        self.backend_url = non_empty_env("CHAT_AGENT_BACKEND_URL").or(self.backend_url);
        self.backend_token = non_empty_env("CHAT_AGENT_BACKEND_TOKEN").or(self.backend_token);
        self
    }
}
