//! Sandbox file tools. Every path is resolved against the sandbox root before
//! any I/O, and every mutation goes through a [`PatchOperation`] computed
//! fully in memory before the single write or removal.

use std::path::{Path, PathBuf};

use base64::Engine;
use chat_agent_error::ChatAgentError;
use chat_agent_patch::{unified_diff, PatchError, PatchKind, PatchOperation};
use serde_json::{json, Value};

use super::{positive_int, required_str, ToolContext};
use crate::sandbox::{display_path, resolve_path};

const MAX_READ_LINES: usize = 10_000;

fn target(
    ctx: &ToolContext<'_>,
    args: &Value,
    tool: &str,
) -> Result<(PathBuf, String), ChatAgentError> {
    let raw = required_str(args, &["path", "file_path"], tool)?;
    let path = resolve_path(ctx.sandbox.root(), raw)?;
    let shown = display_path(ctx.sandbox.root(), &path);
    Ok((path, shown))
}

fn patch_error(path: &str, err: PatchError) -> ChatAgentError {
    ChatAgentError::PatchFailed {
        message: format!("{path}: {err}"),
    }
}

/// Reads the current text of `path`. `Ok(None)` means the file does not
/// exist; binary content is an argument error for text tools.
async fn current_text(
    ctx: &ToolContext<'_>,
    path: &Path,
    shown: &str,
    tool: &str,
) -> Result<Option<String>, ChatAgentError> {
    match ctx.sandbox.read_file(path).await {
        Ok(bytes) => String::from_utf8(bytes).map(Some).map_err(|_| {
            ChatAgentError::invalid(format!("{tool} only supports text files: {shown}"))
        }),
        Err(ChatAgentError::FileNotFound { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

pub(crate) async fn read(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ChatAgentError> {
    let (path, shown) = target(ctx, args, "Read")?;
    let offset = positive_int(args, "offset").unwrap_or(1);
    let limit = positive_int(args, "limit").map(|limit| limit.min(MAX_READ_LINES));

    let bytes = ctx.sandbox.read_file(&path).await?;
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            return Ok(json!({
                "success": true,
                "file_path": shown,
                "is_binary": true,
                "content": base64::engine::general_purpose::STANDARD.encode(err.into_bytes()),
                "content_encoding": "base64",
            }));
        }
    };

    let normalized = text.replace("\r\n", "\n");
    let lines: Vec<&str> = normalized.split('\n').collect();
    let total = lines.len();
    let selected: Vec<&str> = lines
        .iter()
        .skip(offset - 1)
        .take(limit.unwrap_or(usize::MAX))
        .copied()
        .collect();
    Ok(json!({
        "success": true,
        "file_path": shown,
        "is_binary": false,
        "content": selected.join("\n"),
        "offset": offset,
        "limit": limit,
        "total_lines": total,
        "returned_lines": selected.len(),
    }))
}

pub(crate) async fn edit(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ChatAgentError> {
    let (path, shown) = target(ctx, args, "Edit")?;
    let old = args
        .get("old_string")
        .and_then(Value::as_str)
        .filter(|old| !old.is_empty())
        .ok_or_else(|| ChatAgentError::invalid("old_string is required for Edit"))?;
    let new = args
        .get("new_string")
        .and_then(Value::as_str)
        .ok_or_else(|| ChatAgentError::invalid("new_string must be a string (it may be empty)"))?;
    if old == new {
        return Err(ChatAgentError::invalid("new_string must differ from old_string"));
    }
    let replace_all = args
        .get("replace_all")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let current = current_text(ctx, &path, &shown, "Edit")
        .await?
        .ok_or(ChatAgentError::FileNotFound {
            path: shown.clone(),
        })?;
    let matches = current.matches(old).count();
    if matches == 0 {
        return Err(ChatAgentError::invalid(format!(
            "old_string was not found in {shown}"
        )));
    }
    if matches > 1 && !replace_all {
        return Err(ChatAgentError::invalid(format!(
            "old_string matches {matches} times in {shown}; pass replace_all=true or make it more specific"
        )));
    }

    let (next, replacements) = if replace_all {
        (current.replace(old, new), matches)
    } else {
        (current.replacen(old, new, 1), 1)
    };
    let diff = unified_diff(&current, &next);
    let operation = PatchOperation::update(shown.clone(), diff.text);
    let rendered = operation
        .render(Some(&current))
        .map_err(|err| patch_error(&shown, err))?
        .unwrap_or_default();
    ctx.sandbox.write_file(&path, rendered.as_bytes()).await?;
    tracing::info!(
        chat_id = ctx.chat_id,
        path = %shown,
        replacements,
        added = diff.added,
        removed = diff.removed,
        "file edited"
    );
    Ok(json!({
        "success": true,
        "file_path": shown,
        "replacements": replacements,
        "added": diff.added,
        "removed": diff.removed,
        "status": "completed",
    }))
}

pub(crate) async fn write(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ChatAgentError> {
    let (path, shown) = target(ctx, args, "Write")?;
    let content = args
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| ChatAgentError::invalid("content must be a string (it may be empty)"))?;

    let current = current_text(ctx, &path, &shown, "Write").await?;
    if current.as_deref() == Some(content) {
        return Ok(json!({
            "success": true,
            "file_path": shown,
            "status": "completed",
            "changed": false,
            "output": "no changes needed",
        }));
    }

    let before = current.as_deref().unwrap_or_default();
    let diff = unified_diff(before, content);
    let operation = match current {
        Some(_) => PatchOperation::update(shown.clone(), diff.text.clone()),
        None => PatchOperation::create(shown.clone(), diff.text.clone()),
    };
    // An empty new file has an empty diff, which render rejects.
    let rendered = if diff.is_empty() {
        content.to_string()
    } else {
        operation
            .render(current.as_deref())
            .map_err(|err| patch_error(&shown, err))?
            .unwrap_or_default()
    };
    ctx.sandbox.write_file(&path, rendered.as_bytes()).await?;
    tracing::info!(
        chat_id = ctx.chat_id,
        path = %shown,
        operation = operation.kind.as_str(),
        "file written"
    );
    Ok(json!({
        "success": true,
        "file_path": shown,
        "status": "completed",
        "changed": true,
        "operation": operation.kind.as_str(),
        "added": diff.added,
        "removed": diff.removed,
    }))
}

pub(crate) async fn delete(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ChatAgentError> {
    let (path, shown) = target(ctx, args, "Delete")?;
    let operation = PatchOperation::delete(shown.clone());
    let removed = commit(ctx, &path, &shown, &operation).await?;
    tracing::info!(chat_id = ctx.chat_id, path = %shown, removed, "file deleted");
    Ok(json!({
        "success": true,
        "file_path": shown,
        "status": "completed",
        "deleted": removed,
    }))
}

/// Renders `operation` against the current content and performs its one disk
/// change. Returns whether anything on disk changed.
async fn commit(
    ctx: &ToolContext<'_>,
    path: &Path,
    shown: &str,
    operation: &PatchOperation,
) -> Result<bool, ChatAgentError> {
    let current = match operation.kind {
        PatchKind::CreateFile => None,
        PatchKind::UpdateFile => Some(
            current_text(ctx, path, shown, "apply_patch")
                .await?
                .ok_or(ChatAgentError::FileNotFound {
                    path: shown.to_string(),
                })?,
        ),
        PatchKind::DeleteFile => return ctx.sandbox.remove_file(path).await,
    };
    let rendered = operation
        .render(current.as_deref())
        .map_err(|err| patch_error(shown, err))?
        .unwrap_or_default();
    ctx.sandbox.write_file(path, rendered.as_bytes()).await?;
    Ok(true)
}

/// Applies one provider patch operation, given either inline
/// (`{type, path, diff}`) or wrapped as `{operation: {...}}`.
pub(crate) async fn apply_patch(
    ctx: &ToolContext<'_>,
    args: &Value,
) -> Result<Value, ChatAgentError> {
    let raw = args.get("operation").unwrap_or(args).clone();
    let operation: PatchOperation = serde_json::from_value(raw)
        .map_err(|err| ChatAgentError::invalid(format!("invalid patch operation: {err}")))?;
    let path = resolve_path(ctx.sandbox.root(), &operation.path)?;
    let shown = display_path(ctx.sandbox.root(), &path);

    let changed = commit(ctx, &path, &shown, &operation).await?;
    let output = match operation.kind {
        PatchKind::DeleteFile if !changed => format!("{shown} did not exist"),
        PatchKind::DeleteFile => format!("deleted {shown}"),
        PatchKind::CreateFile => format!("created {shown}"),
        PatchKind::UpdateFile => format!("updated {shown}"),
    };
    tracing::info!(
        chat_id = ctx.chat_id,
        path = %shown,
        operation = operation.kind.as_str(),
        "patch applied"
    );
    Ok(json!({
        "success": true,
        "status": "completed",
        "file_path": shown,
        "output": output,
    }))
}
