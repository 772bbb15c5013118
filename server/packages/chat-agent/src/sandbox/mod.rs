//! Compute environment abstraction.
//!
//! A [`Sandbox`] is an isolated filesystem root plus the ability to run
//! commands inside it. Sessions only ever talk to sandboxes through these
//! traits, so the hosted sandbox service and the local directory provider are
//! interchangeable.

mod local;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chat_agent_error::ChatAgentError;
use rand::distributions::Alphanumeric;
use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use utoipa::ToSchema;

pub use local::{LocalSandbox, LocalSandboxProvider};

/// One chunk of output from a detached process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChunk {
    Stdout(String),
    Stderr(String),
    /// The producer failed and will send nothing further.
    Fatal(String),
}

pub type LogReceiver = mpsc::Receiver<LogChunk>;

#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// `program arg...` for log lines. Environment values are never included.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Opaque reference to a persisted filesystem snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(transparent)]
pub struct SnapshotHandle(pub String);

impl SnapshotHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

#[async_trait]
pub trait Sandbox: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    /// Absolute path every file operation must stay under.
    fn root(&self) -> &Path;

    /// Runs a command to completion and captures its output.
    async fn run(&self, command: CommandSpec) -> Result<CommandOutput, ChatAgentError>;

    /// Starts a command without waiting for it. Output is delivered through a
    /// channel holding at most `capacity` chunks; the reader applies
    /// backpressure to the process when it falls behind.
    async fn spawn_detached(
        &self,
        command: CommandSpec,
        capacity: usize,
    ) -> Result<LogReceiver, ChatAgentError>;

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>, ChatAgentError>;

    /// Writes `contents`, creating parent directories as needed.
    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), ChatAgentError>;

    /// Returns `false` when there was nothing to remove.
    async fn remove_file(&self, path: &Path) -> Result<bool, ChatAgentError>;

    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, ChatAgentError>;

    async fn snapshot(&self) -> Result<SnapshotHandle, ChatAgentError>;

    async fn stop(&self) -> Result<(), ChatAgentError>;
}

#[async_trait]
pub trait SandboxProvider: Send + Sync + fmt::Debug {
    async fn create(&self) -> Result<Arc<dyn Sandbox>, ChatAgentError>;

    async fn restore(&self, snapshot: &SnapshotHandle) -> Result<Arc<dyn Sandbox>, ChatAgentError>;

    /// Deletes a snapshot that nothing refers to any more. Unknown handles
    /// are not an error.
    async fn discard(&self, snapshot: &SnapshotHandle) -> Result<(), ChatAgentError>;
}

/// Resolves a caller-supplied path against `root`.
///
/// Relative paths are joined onto the root; absolute paths must already be
/// inside it. Any `..` component is rejected outright, before the path is
/// ever handed to the filesystem.
pub fn resolve_path(root: &Path, raw: &str) -> Result<PathBuf, ChatAgentError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ChatAgentError::invalid("path is required"));
    }
    if raw.contains('\0') {
        return Err(ChatAgentError::invalid("path contains a NUL byte"));
    }

    let candidate = Path::new(raw);
    if candidate
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(ChatAgentError::PermissionDenied {
            message: format!("path traversal is not allowed: {raw}"),
        });
    }

    let joined = if candidate.is_absolute() {
        if !candidate.starts_with(root) {
            return Err(ChatAgentError::PermissionDenied {
                message: format!("path is outside the sandbox root: {raw}"),
            });
        }
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    Ok(joined
        .components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect())
}

/// Path relative to the sandbox root, for tool output.
pub fn display_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|relative| relative.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string_lossy().into_owned())
}

pub fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_ascii_lowercase()
}
