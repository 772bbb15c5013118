use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{create_content, update_content, PatchError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    CreateFile,
    UpdateFile,
    DeleteFile,
}

impl PatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateFile => "create_file",
            Self::UpdateFile => "update_file",
            Self::DeleteFile => "delete_file",
        }
    }
}

/// A single file mutation expressed as a unified diff. The path is resolved
/// against a sandbox root by the caller before any content is touched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
pub struct PatchOperation {
    #[serde(rename = "type")]
    pub kind: PatchKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

impl PatchOperation {
    pub fn create(path: impl Into<String>, diff: impl Into<String>) -> Self {
        Self {
            kind: PatchKind::CreateFile,
            path: path.into(),
            diff: Some(diff.into()),
        }
    }

    pub fn update(path: impl Into<String>, diff: impl Into<String>) -> Self {
        Self {
            kind: PatchKind::UpdateFile,
            path: path.into(),
            diff: Some(diff.into()),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            kind: PatchKind::DeleteFile,
            path: path.into(),
            diff: None,
        }
    }

    fn diff_text(&self) -> Result<&str, PatchError> {
        match self.diff.as_deref() {
            Some(diff) if !diff.trim().is_empty() => Ok(diff),
            _ => Err(PatchError::MissingDiff {
                kind: self.kind.as_str(),
            }),
        }
    }

    /// Computes the resulting content. `current` is `None` when the target
    /// does not exist; deletes yield `Ok(None)`.
    pub fn render(&self, current: Option<&str>) -> Result<Option<String>, PatchError> {
        match self.kind {
            PatchKind::CreateFile => create_content(self.diff_text()?).map(Some),
            PatchKind::UpdateFile => {
                let diff = self.diff_text()?;
                let current = current.unwrap_or_default();
                update_content(current, diff).map(Some)
            }
            PatchKind::DeleteFile => Ok(None),
        }
    }
}
