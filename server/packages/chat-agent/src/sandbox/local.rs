use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chat_agent_error::ChatAgentError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};

use super::{
    random_id, CommandOutput, CommandSpec, DirEntry, LogChunk, LogReceiver, Sandbox,
    SandboxProvider, SnapshotHandle,
};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Sandboxes backed by plain directories on the host, with tar.gz snapshots.
#[derive(Debug, Clone)]
pub struct LocalSandboxProvider {
    sandboxes_dir: PathBuf,
    snapshots_dir: PathBuf,
}

impl LocalSandboxProvider {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self, ChatAgentError> {
        let data_dir = data_dir.as_ref();
        let sandboxes_dir = data_dir.join("sandboxes");
        let snapshots_dir = data_dir.join("snapshots");
        for dir in [&sandboxes_dir, &snapshots_dir] {
            std::fs::create_dir_all(dir).map_err(|err| {
                ChatAgentError::sandbox(format!("failed to create {}: {err}", dir.display()))
            })?;
        }
        Ok(Self {
            sandboxes_dir,
            snapshots_dir,
        })
    }

    async fn allocate(&self) -> Result<LocalSandbox, ChatAgentError> {
        let id = format!("sbx_{}", random_id(12));
        let root = self.sandboxes_dir.join(&id);
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|err| ChatAgentError::sandbox(format!("failed to create sandbox: {err}")))?;
        Ok(LocalSandbox {
            id,
            root,
            snapshots_dir: self.snapshots_dir.clone(),
            kill_switches: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

fn snapshot_file(dir: &Path, handle: &SnapshotHandle) -> Result<PathBuf, ChatAgentError> {
    let valid = !handle.as_str().is_empty()
        && handle
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(ChatAgentError::invalid(format!(
            "invalid snapshot handle: {handle}"
        )));
    }
    Ok(dir.join(format!("{handle}.tar.gz")))
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn create(&self) -> Result<Arc<dyn Sandbox>, ChatAgentError> {
        let sandbox = self.allocate().await?;
        tracing::info!(sandbox_id = %sandbox.id, root = %sandbox.root.display(), "sandbox created");
        Ok(Arc::new(sandbox))
    }

    async fn restore(&self, snapshot: &SnapshotHandle) -> Result<Arc<dyn Sandbox>, ChatAgentError> {
        let archive = snapshot_file(&self.snapshots_dir, snapshot)?;
        if !tokio::fs::try_exists(&archive).await.unwrap_or(false) {
            return Err(ChatAgentError::sandbox(format!(
                "snapshot not found: {snapshot}"
            )));
        }

        let started = Instant::now();
        let sandbox = self.allocate().await?;
        let root = sandbox.root.clone();
        let unpacked = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = File::open(&archive)?;
            tar::Archive::new(GzDecoder::new(file)).unpack(&root)
        })
        .await
        .map_err(|err| ChatAgentError::sandbox(format!("restore task failed: {err}")))?;

        if let Err(err) = unpacked {
            let _ = sandbox.stop().await;
            return Err(ChatAgentError::sandbox(format!(
                "failed to restore snapshot {snapshot}: {err}"
            )));
        }
        tracing::info!(
            sandbox_id = %sandbox.id,
            snapshot = %snapshot,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sandbox restored from snapshot"
        );
        Ok(Arc::new(sandbox))
    }

    async fn discard(&self, snapshot: &SnapshotHandle) -> Result<(), ChatAgentError> {
        let archive = snapshot_file(&self.snapshots_dir, snapshot)?;
        match tokio::fs::remove_file(&archive).await {
            Ok(()) => {
                tracing::debug!(snapshot = %snapshot, "snapshot discarded");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ChatAgentError::sandbox(format!(
                "failed to discard snapshot {snapshot}: {err}"
            ))),
        }
    }
}

#[derive(Debug)]
pub struct LocalSandbox {
    id: String,
    root: PathBuf,
    snapshots_dir: PathBuf,
    kill_switches: Arc<Mutex<Vec<oneshot::Sender<()>>>>,
}

impl LocalSandbox {
    fn command(&self, spec: &CommandSpec) -> Command {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(spec.cwd.as_deref().unwrap_or(&self.root))
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> ChatAgentError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ChatAgentError::FileNotFound {
            path: path.display().to_string(),
        }
    } else {
        ChatAgentError::sandbox(format!("failed to {action} {}: {err}", path.display()))
    }
}

/// Decodes as much of `pending` as forms complete UTF-8, keeping a split
/// trailing sequence for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(err) if err.error_len().is_none() => {
            let valid = err.valid_up_to();
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

fn spawn_pipe_reader<R>(
    mut reader: R,
    sender: mpsc::Sender<LogChunk>,
    wrap: fn(String) -> LogChunk,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        let mut pending = Vec::new();
        loop {
            let read = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(read) => read,
            };
            pending.extend_from_slice(&buf[..read]);
            let text = take_utf8(&mut pending);
            if text.is_empty() {
                continue;
            }
            if sender.send(wrap(text)).await.is_err() {
                break;
            }
        }
        if !pending.is_empty() {
            let _ = sender
                .send(wrap(String::from_utf8_lossy(&pending).into_owned()))
                .await;
        }
    });
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn root(&self) -> &Path {
        &self.root
    }

    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, ChatAgentError> {
        let started = Instant::now();
        let output = self
            .command(&spec)
            .output()
            .await
            .map_err(|err| ChatAgentError::sandbox(format!("failed to run `{}`: {err}", spec.display())))?;
        tracing::debug!(
            sandbox_id = %self.id,
            command = %spec.display(),
            exit_code = ?output.status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "command finished"
        );
        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn spawn_detached(
        &self,
        spec: CommandSpec,
        capacity: usize,
    ) -> Result<LogReceiver, ChatAgentError> {
        let mut command = self.command(&spec);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn().map_err(|err| {
            ChatAgentError::sandbox(format!("failed to spawn `{}`: {err}", spec.display()))
        })?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChatAgentError::sandbox("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ChatAgentError::sandbox("failed to capture stderr"))?;

        let (sender, receiver) = mpsc::channel(capacity.max(1));
        spawn_pipe_reader(stdout, sender.clone(), LogChunk::Stdout);
        spawn_pipe_reader(stderr, sender, LogChunk::Stderr);

        let (kill_tx, kill_rx) = oneshot::channel();
        {
            let mut switches = self.kill_switches.lock().await;
            // The receiver goes away once its process has exited.
            switches.retain(|switch| !switch.is_closed());
            switches.push(kill_tx);
        }
        let sandbox_id = self.id.clone();
        let started = Instant::now();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    tracing::info!(
                        sandbox_id = %sandbox_id,
                        pid = ?pid,
                        exit_code = ?status.ok().and_then(|status| status.code()),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "detached process exited"
                    );
                }
                _ = kill_rx => {
                    let _ = child.kill().await;
                    tracing::info!(sandbox_id = %sandbox_id, pid = ?pid, "detached process killed");
                }
            }
        });

        tracing::info!(sandbox_id = %self.id, pid = ?pid, command = %spec.display(), "detached process started");
        Ok(receiver)
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>, ChatAgentError> {
        tokio::fs::read(path)
            .await
            .map_err(|err| io_error("read", path, err))
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), ChatAgentError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error("create directory", parent, err))?;
        }
        tokio::fs::write(path, contents)
            .await
            .map_err(|err| io_error("write", path, err))
    }

    async fn remove_file(&self, path: &Path) -> Result<bool, ChatAgentError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error("remove", path, err)),
        }
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, ChatAgentError> {
        let mut reader = tokio::fs::read_dir(path)
            .await
            .map_err(|err| io_error("list", path, err))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| io_error("list", path, err))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|err| io_error("stat", &entry.path(), err))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn snapshot(&self) -> Result<SnapshotHandle, ChatAgentError> {
        let handle = SnapshotHandle(format!("snap_{}", random_id(16)));
        let archive = snapshot_file(&self.snapshots_dir, &handle)?;
        let root = self.root.clone();
        let started = Instant::now();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = File::create(&archive)?;
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
            builder.append_dir_all(".", &root)?;
            builder.into_inner()?.finish()?;
            Ok(())
        })
        .await
        .map_err(|err| ChatAgentError::sandbox(format!("snapshot task failed: {err}")))?
        .map_err(|err| ChatAgentError::sandbox(format!("snapshot failed: {err}")))?;
        tracing::info!(
            sandbox_id = %self.id,
            snapshot = %handle,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sandbox snapshot written"
        );
        Ok(handle)
    }

    async fn stop(&self) -> Result<(), ChatAgentError> {
        for switch in self.kill_switches.lock().await.drain(..) {
            let _ = switch.send(());
        }
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(ChatAgentError::sandbox(format!(
                    "failed to remove sandbox {}: {err}",
                    self.id
                )))
            }
        }
        tracing::info!(sandbox_id = %self.id, "sandbox stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut receiver: LogReceiver) -> (String, String) {
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = receiver.recv().await {
            match chunk {
                LogChunk::Stdout(text) => stdout.push_str(&text),
                LogChunk::Stderr(text) => stderr.push_str(&text),
                LogChunk::Fatal(message) => panic!("unexpected fatal chunk: {message}"),
            }
        }
        (stdout, stderr)
    }

    #[tokio::test]
    async fn snapshot_restores_files_into_a_new_sandbox() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = LocalSandboxProvider::new(dir.path()).expect("provider");
        let sandbox = provider.create().await.expect("create");
        let file = sandbox.root().join("notes/todo.md");
        sandbox.write_file(&file, b"- ship it\n").await.expect("write");

        let handle = sandbox.snapshot().await.expect("snapshot");
        sandbox.stop().await.expect("stop");
        assert!(!sandbox.root().exists());

        let restored = provider.restore(&handle).await.expect("restore");
        assert_ne!(restored.id(), sandbox.id());
        let contents = restored
            .read_file(&restored.root().join("notes/todo.md"))
            .await
            .expect("read");
        assert_eq!(contents, b"- ship it\n");
    }

    #[tokio::test]
    async fn restore_rejects_unknown_or_malformed_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = LocalSandboxProvider::new(dir.path()).expect("provider");
        let missing = provider.restore(&SnapshotHandle("snap_missing".into())).await;
        assert!(matches!(missing, Err(ChatAgentError::SandboxFailed { .. })));
        let malformed = provider.restore(&SnapshotHandle("../etc".into())).await;
        assert!(matches!(malformed, Err(ChatAgentError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn run_captures_exit_code_and_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = LocalSandboxProvider::new(dir.path()).expect("provider");
        let sandbox = provider.create().await.expect("create");
        let output = sandbox
            .run(CommandSpec::new("sh").args(["-c", "pwd; echo oops >&2; exit 3"]))
            .await
            .expect("run");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stderr.trim(), "oops");
        let pwd = std::fs::canonicalize(output.stdout.trim()).expect("pwd");
        assert_eq!(pwd, std::fs::canonicalize(sandbox.root()).expect("root"));
    }

    #[tokio::test]
    async fn detached_process_streams_both_pipes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = LocalSandboxProvider::new(dir.path()).expect("provider");
        let sandbox = provider.create().await.expect("create");
        let receiver = sandbox
            .spawn_detached(
                CommandSpec::new("sh")
                    .args(["-c", "echo \"$GREETING\"; echo warn >&2"])
                    .env("GREETING", "{\"type\":\"delta\",\"text\":\"hi\"}"),
                4,
            )
            .await
            .expect("spawn");
        let (stdout, stderr) = drain(receiver).await;
        assert_eq!(stdout, "{\"type\":\"delta\",\"text\":\"hi\"}\n");
        assert_eq!(stderr, "warn\n");
    }

    #[tokio::test]
    async fn finished_processes_release_their_kill_switches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = LocalSandboxProvider::new(dir.path()).expect("provider");
        let sandbox = provider.allocate().await.expect("allocate");
        for _ in 0..3 {
            let receiver = sandbox
                .spawn_detached(CommandSpec::new("true"), 1)
                .await
                .expect("spawn");
            drain(receiver).await;
            for _ in 0..100 {
                if sandbox.kill_switches.lock().await.iter().all(|s| s.is_closed()) {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        }
        let receiver = sandbox
            .spawn_detached(CommandSpec::new("true"), 1)
            .await
            .expect("spawn");
        assert_eq!(sandbox.kill_switches.lock().await.len(), 1);
        drain(receiver).await;
    }

    #[tokio::test]
    async fn discard_removes_the_archive_and_ignores_unknown_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = LocalSandboxProvider::new(dir.path()).expect("provider");
        let sandbox = provider.create().await.expect("create");
        let handle = sandbox.snapshot().await.expect("snapshot");
        let archive = snapshot_file(&provider.snapshots_dir, &handle).expect("path");
        assert!(archive.exists());

        provider.discard(&handle).await.expect("discard");
        assert!(!archive.exists());
        provider.discard(&handle).await.expect("discard again");
        assert!(matches!(
            provider.discard(&SnapshotHandle("../etc".into())).await,
            Err(ChatAgentError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn utf8_sequences_split_across_reads_are_preserved() {
        let bytes = "olá".as_bytes();
        let mut pending = bytes[..3].to_vec();
        assert_eq!(take_utf8(&mut pending), "ol");
        pending.extend_from_slice(&bytes[3..]);
        assert_eq!(take_utf8(&mut pending), "á");
        assert!(pending.is_empty());
    }
}
