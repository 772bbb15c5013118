//! Session lifecycle: provisioning, reuse, snapshot hibernation and
//! capability tokens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chat_agent_error::ChatAgentError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::models::{normalize_model, normalize_provider, Provider};
use crate::sandbox::{random_id, CommandSpec, Sandbox, SandboxProvider, SnapshotHandle};
use crate::store::ChatStore;
use crate::tokens::{CapabilityToken, TokenPolicy};

const MAX_CHAT_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupMode {
    Reused,
    Snapshot,
    Cold,
}

/// One provisioning stage as reported back from `start`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineStep {
    pub name: String,
    pub ms: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub chat_id: String,
    pub reused: bool,
    pub startup_mode: StartupMode,
    pub timeline: Vec<TimelineStep>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotOutcome {
    pub snapshot_id: SnapshotHandle,
    pub ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SessionStatus {
    Off,
    #[serde(rename_all = "camelCase")]
    Running {
        chat_id: String,
        provider: Provider,
        model: String,
        integrations_enabled: bool,
        last_used_at: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct SessionState {
    last_used_at: DateTime<Utc>,
    token: CapabilityToken,
    provider: Provider,
    model: String,
    integrations_enabled: bool,
    external_user: Option<String>,
}

/// Everything an adapter needs for one turn, copied out of the session so no
/// lock is held while the turn runs.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub chat_id: String,
    pub sandbox: Arc<dyn Sandbox>,
    pub token: String,
    pub provider: Provider,
    pub model: String,
    pub integrations_enabled: bool,
    pub external_user: Option<String>,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    sandbox: Arc<dyn Sandbox>,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    turn_lock: Arc<Mutex<()>>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn touch(&self) {
        self.state.lock().await.last_used_at = Utc::now();
    }

    pub async fn turn_context(&self) -> TurnContext {
        let state = self.state.lock().await;
        TurnContext {
            chat_id: self.id.clone(),
            sandbox: self.sandbox.clone(),
            token: state.token.value().to_string(),
            provider: state.provider,
            model: state.model.clone(),
            integrations_enabled: state.integrations_enabled,
            external_user: state.external_user.clone(),
        }
    }
}

/// Held for the duration of one turn, including transcript persistence.
#[derive(Debug)]
pub struct TurnGuard {
    chat_id: String,
    _lock: OwnedMutexGuard<()>,
}

impl TurnGuard {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub token_policy: TokenPolicy,
    /// Program and arguments run in the sandbox root on cold start. Empty
    /// skips the install stage.
    pub install_command: Vec<String>,
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    provider: Arc<dyn SandboxProvider>,
    store: Arc<dyn ChatStore>,
    config: RegistryConfig,
}

pub fn validate_chat_id(chat_id: &str) -> Result<(), ChatAgentError> {
    let valid = !chat_id.is_empty()
        && chat_id.len() <= MAX_CHAT_ID_LEN
        && chat_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ChatAgentError::invalid(format!("invalid chat id: {chat_id:?}")))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

impl SessionRegistry {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        store: Arc<dyn ChatStore>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            provider,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub async fn get(&self, chat_id: &str) -> Result<Arc<Session>, ChatAgentError> {
        self.sessions
            .read()
            .await
            .get(chat_id)
            .cloned()
            .ok_or_else(|| ChatAgentError::SessionNotFound {
                chat_id: chat_id.to_string(),
            })
    }

    /// Resolves a live session or provisions one, restoring from the stored
    /// snapshot when there is one.
    pub async fn start(
        &self,
        requested_id: Option<&str>,
        external_user: Option<String>,
    ) -> Result<StartOutcome, ChatAgentError> {
        let chat_id = match requested_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => {
                validate_chat_id(id)?;
                id.to_string()
            }
            None => random_id(24),
        };

        if let Some(session) = self.sessions.read().await.get(&chat_id).cloned() {
            self.refresh_reused(&session, external_user).await;
            tracing::info!(chat_id = %chat_id, sandbox_id = session.sandbox.id(), "reusing live session");
            return Ok(StartOutcome {
                chat_id,
                reused: true,
                startup_mode: StartupMode::Reused,
                timeline: Vec::new(),
            });
        }

        let record = match self.store.load(&chat_id).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(chat_id = %chat_id, error = %err, "failed to load chat record");
                None
            }
        };
        let mut timeline = Vec::new();
        let (sandbox, startup_mode) = self
            .provision(&chat_id, record.as_ref().and_then(|r| r.snapshot_id.clone()), &mut timeline)
            .await?;

        let stored_model = record.as_ref().and_then(|r| r.model.clone());
        let stored_provider = record.as_ref().and_then(|r| r.provider.clone());
        let provider = normalize_provider(stored_provider.as_deref(), stored_model.as_deref());
        let model = normalize_model(provider, stored_model.as_deref());

        let now = Utc::now();
        let session = Arc::new(Session {
            id: chat_id.clone(),
            sandbox: sandbox.clone(),
            created_at: now,
            state: Mutex::new(SessionState {
                last_used_at: now,
                token: CapabilityToken::mint(&chat_id, &self.config.token_policy),
                provider,
                model,
                integrations_enabled: false,
                external_user: external_user.clone(),
            }),
            turn_lock: Arc::new(Mutex::new(())),
        });

        let winner = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&chat_id) {
                Some(existing) => Some(existing.clone()),
                None => {
                    sessions.insert(chat_id.clone(), session);
                    None
                }
            }
        };

        if let Some(existing) = winner {
            tracing::info!(chat_id = %chat_id, "lost start race; discarding new sandbox");
            if let Err(err) = sandbox.stop().await {
                tracing::warn!(chat_id = %chat_id, error = %err, "failed to stop discarded sandbox");
            }
            self.refresh_reused(&existing, external_user).await;
            return Ok(StartOutcome {
                chat_id,
                reused: true,
                startup_mode: StartupMode::Reused,
                timeline,
            });
        }

        tracing::info!(
            chat_id = %chat_id,
            sandbox_id = sandbox.id(),
            mode = ?startup_mode,
            "session started"
        );
        Ok(StartOutcome {
            chat_id,
            reused: false,
            startup_mode,
            timeline,
        })
    }

    async fn refresh_reused(&self, session: &Session, external_user: Option<String>) {
        let mut state = session.state.lock().await;
        state.last_used_at = Utc::now();
        if state.token.needs_refresh(&self.config.token_policy) {
            tracing::debug!(chat_id = %session.id, "reissuing capability token");
            state.token = CapabilityToken::mint(&session.id, &self.config.token_policy);
        }
        if external_user.is_some() {
            state.external_user = external_user;
        }
    }

    async fn provision(
        &self,
        chat_id: &str,
        snapshot: Option<SnapshotHandle>,
        timeline: &mut Vec<TimelineStep>,
    ) -> Result<(Arc<dyn Sandbox>, StartupMode), ChatAgentError> {
        if let Some(handle) = snapshot {
            let started = Instant::now();
            match self.provider.restore(&handle).await {
                Ok(sandbox) => {
                    timeline.push(TimelineStep {
                        name: "restore_snapshot".to_string(),
                        ms: elapsed_ms(started),
                        ok: true,
                        exit_code: None,
                    });
                    return Ok((sandbox, StartupMode::Snapshot));
                }
                Err(err) => {
                    tracing::warn!(
                        chat_id = %chat_id,
                        snapshot = %handle,
                        error = %err,
                        "snapshot restore failed; falling back to cold start"
                    );
                    timeline.push(TimelineStep {
                        name: "restore_snapshot".to_string(),
                        ms: elapsed_ms(started),
                        ok: false,
                        exit_code: None,
                    });
                }
            }
        }

        let started = Instant::now();
        let sandbox = self.provider.create().await.map_err(|err| {
            tracing::error!(chat_id = %chat_id, error = %err, "sandbox creation failed");
            ChatAgentError::ProvisionFailed {
                stage: "create_sandbox".to_string(),
                exit_code: None,
                stdout: None,
                stderr: Some(err.to_string()),
            }
        })?;
        timeline.push(TimelineStep {
            name: "create_sandbox".to_string(),
            ms: elapsed_ms(started),
            ok: true,
            exit_code: None,
        });

        if let Some((program, args)) = self.config.install_command.split_first() {
            let started = Instant::now();
            let command = CommandSpec::new(program.clone())
                .args(args.iter().cloned())
                .cwd(sandbox.root());
            let result = sandbox.run(command).await;
            let (ok, exit_code) = match &result {
                Ok(output) => (output.success(), output.exit_code),
                Err(_) => (false, None),
            };
            timeline.push(TimelineStep {
                name: "install_dependencies".to_string(),
                ms: elapsed_ms(started),
                ok,
                exit_code,
            });
            if !ok {
                tracing::error!(chat_id = %chat_id, exit_code = ?exit_code, "dependency install failed");
                if let Err(err) = sandbox.stop().await {
                    tracing::warn!(chat_id = %chat_id, error = %err, "failed to stop partial sandbox");
                }
                return Err(match result {
                    Ok(output) => ChatAgentError::ProvisionFailed {
                        stage: "install_dependencies".to_string(),
                        exit_code: output.exit_code,
                        stdout: Some(output.stdout),
                        stderr: Some(output.stderr),
                    },
                    Err(err) => ChatAgentError::ProvisionFailed {
                        stage: "install_dependencies".to_string(),
                        exit_code: None,
                        stdout: None,
                        stderr: Some(err.to_string()),
                    },
                });
            }
        }

        Ok((sandbox, StartupMode::Cold))
    }

    /// Hibernates and tears down a session. Snapshot failures are logged and
    /// never prevent teardown.
    pub async fn stop(&self, chat_id: &str) -> Result<Option<SnapshotHandle>, ChatAgentError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(chat_id)
            .ok_or_else(|| ChatAgentError::SessionNotFound {
                chat_id: chat_id.to_string(),
            })?;

        let snapshot = match session.sandbox.snapshot().await {
            Ok(handle) => {
                if let Err(err) = self.record_snapshot(chat_id, &handle).await {
                    tracing::warn!(chat_id = %chat_id, error = %err, "failed to persist snapshot handle");
                }
                Some(handle)
            }
            Err(err) => {
                tracing::warn!(chat_id = %chat_id, error = %err, "snapshot before stop failed");
                None
            }
        };

        if let Err(err) = session.sandbox.stop().await {
            tracing::warn!(chat_id = %chat_id, error = %err, "sandbox stop failed");
        }
        tracing::info!(chat_id = %chat_id, snapshot = ?snapshot, "session stopped");
        Ok(snapshot)
    }

    /// Points the chat at `handle` and deletes the snapshot it replaces.
    async fn record_snapshot(
        &self,
        chat_id: &str,
        handle: &SnapshotHandle,
    ) -> Result<(), ChatAgentError> {
        let previous = self
            .store
            .load(chat_id)
            .await?
            .and_then(|record| record.snapshot_id);
        self.store.set_snapshot(chat_id, Some(handle.clone())).await?;
        if let Some(previous) = previous.filter(|previous| previous != handle) {
            if let Err(err) = self.provider.discard(&previous).await {
                tracing::warn!(chat_id = %chat_id, snapshot = %previous, error = %err, "failed to discard old snapshot");
            }
        }
        Ok(())
    }

    pub async fn snapshot(&self, chat_id: &str) -> Result<SnapshotOutcome, ChatAgentError> {
        let session = self.get(chat_id).await?;
        let started = Instant::now();
        let handle = session.sandbox.snapshot().await?;
        self.record_snapshot(chat_id, &handle).await?;
        session.touch().await;
        Ok(SnapshotOutcome {
            snapshot_id: handle,
            ms: elapsed_ms(started),
        })
    }

    /// Normalizes and records the model for a chat. Chats without a live
    /// session keep the choice for their next `start`.
    pub async fn set_model(
        &self,
        chat_id: &str,
        model: Option<&str>,
        provider: Option<&str>,
    ) -> Result<(Provider, String), ChatAgentError> {
        validate_chat_id(chat_id)?;
        let provider = normalize_provider(provider, model);
        let model = normalize_model(provider, model);

        let session = self.sessions.read().await.get(chat_id).cloned();
        if let Some(session) = session {
            let mut state = session.state.lock().await;
            state.provider = provider;
            state.model = model.clone();
            state.last_used_at = Utc::now();
        }
        if let Err(err) = self.store.set_model(chat_id, provider.as_str(), &model).await {
            tracing::warn!(chat_id = %chat_id, error = %err, "failed to persist model choice");
        }
        Ok((provider, model))
    }

    pub async fn set_integrations(&self, chat_id: &str, enabled: bool) -> Result<(), ChatAgentError> {
        let session = self.get(chat_id).await?;
        let mut state = session.state.lock().await;
        state.integrations_enabled = enabled;
        state.last_used_at = Utc::now();
        Ok(())
    }

    pub async fn status(&self, chat_id: &str) -> SessionStatus {
        let Some(session) = self.sessions.read().await.get(chat_id).cloned() else {
            return SessionStatus::Off;
        };
        let state = session.state.lock().await;
        SessionStatus::Running {
            chat_id: session.id.clone(),
            provider: state.provider,
            model: state.model.clone(),
            integrations_enabled: state.integrations_enabled,
            last_used_at: state.last_used_at,
        }
    }

    pub async fn verify_token(&self, chat_id: &str, token: &str) -> bool {
        let Some(session) = self.sessions.read().await.get(chat_id).cloned() else {
            return false;
        };
        let state = session.state.lock().await;
        state.token.authorizes(chat_id, token)
    }

    pub async fn touch(&self, chat_id: &str) -> Result<(), ChatAgentError> {
        self.get(chat_id).await?.touch().await;
        Ok(())
    }

    /// Waits for any running turn on the session to finish, then returns the
    /// context for a new one.
    pub async fn begin_turn(
        &self,
        chat_id: &str,
    ) -> Result<(TurnGuard, TurnContext), ChatAgentError> {
        let session = self.get(chat_id).await?;
        let lock = session.turn_lock.clone().lock_owned().await;
        session.touch().await;
        let context = session.turn_context().await;
        Ok((
            TurnGuard {
                chat_id: chat_id.to_string(),
                _lock: lock,
            },
            context,
        ))
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Stops every live session, snapshotting each one first.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for chat_id in ids {
            if let Err(err) = self.stop(&chat_id).await {
                tracing::warn!(chat_id = %chat_id, error = %err, "failed to stop session");
            }
        }
    }
}
