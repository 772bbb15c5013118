use std::time::{Duration, Instant};

use chat_agent_error::ChatAgentError;
use serde_json::{json, Value};

use super::{required_str, str_arg, ToolContext};
use crate::sandbox::{resolve_path, CommandSpec};

const SHELL_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs `bash -lc <command>` inside the sandbox. A non-zero exit is a normal
/// result with `success: false`, not an error.
pub(crate) async fn call(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ChatAgentError> {
    let command = required_str(args, &["command"], "shell")?;
    let root = ctx.sandbox.root();
    let cwd = match str_arg(args, &["cwd"]) {
        Some(raw) => resolve_path(root, raw)?,
        None => root.to_path_buf(),
    };

    let spec = CommandSpec::new("bash")
        .args(["-lc", command])
        .cwd(cwd.clone());
    let started = Instant::now();
    let output = tokio::time::timeout(SHELL_TIMEOUT, ctx.sandbox.run(spec))
        .await
        .map_err(|_| ChatAgentError::Timeout {
            message: Some(format!(
                "shell command exceeded {}s",
                SHELL_TIMEOUT.as_secs()
            )),
        })??;
    tracing::info!(
        chat_id = ctx.chat_id,
        exit_code = ?output.exit_code,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "shell command finished"
    );
    Ok(json!({
        "success": output.success(),
        "exit_code": output.exit_code,
        "stdout": output.stdout,
        "stderr": output.stderr,
        "cwd": cwd.to_string_lossy(),
    }))
}
