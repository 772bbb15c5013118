//! Chat transcript persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chat_agent_error::ChatAgentError;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::sandbox::SnapshotHandle;
use crate::transcript::TranscriptPart;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<TranscriptPart>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>, client_message_id: Option<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            parts: Vec::new(),
            created_at: Utc::now(),
            client_message_id,
        }
    }

    /// Assistant message whose plain content is the concatenated text parts.
    pub fn assistant(parts: Vec<TranscriptPart>) -> Self {
        let content = parts
            .iter()
            .filter_map(|part| match part {
                TranscriptPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        Self {
            role: ChatRole::Assistant,
            content,
            parts,
            created_at: Utc::now(),
            client_message_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<SnapshotHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub updated_at: DateTime<Utc>,
}

impl ChatRecord {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            snapshot_id: None,
            model: None,
            provider: None,
            messages: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// A change applied to one record while the store holds it exclusively.
/// Returns `false` to leave the record unsaved.
pub type RecordChange = Box<dyn FnOnce(&mut ChatRecord) -> bool + Send>;

/// Storage for chat records.
///
/// Only `load` and `modify` are required. `modify` is a read-modify-write that
/// no other mutation of the same store can interleave with; the helpers are
/// built on it.
#[async_trait]
pub trait ChatStore: Send + Sync + std::fmt::Debug {
    async fn load(&self, chat_id: &str) -> Result<Option<ChatRecord>, ChatAgentError>;

    /// Applies `change` to the stored record, or to a fresh one when the chat
    /// has none, and saves it if `change` returned `true`.
    async fn modify(&self, chat_id: &str, change: RecordChange) -> Result<bool, ChatAgentError>;

    async fn set_snapshot(
        &self,
        chat_id: &str,
        snapshot: Option<SnapshotHandle>,
    ) -> Result<(), ChatAgentError> {
        self.modify(
            chat_id,
            Box::new(move |record| {
                record.snapshot_id = snapshot;
                true
            }),
        )
        .await
        .map(|_| ())
    }

    async fn set_model(
        &self,
        chat_id: &str,
        provider: &str,
        model: &str,
    ) -> Result<(), ChatAgentError> {
        let provider = provider.to_string();
        let model = model.to_string();
        self.modify(
            chat_id,
            Box::new(move |record| {
                record.provider = Some(provider);
                record.model = Some(model);
                true
            }),
        )
        .await
        .map(|_| ())
    }

    /// Appends `message`. A message carrying a `client_message_id` that is
    /// already stored is dropped, so client retries do not duplicate turns.
    async fn append_message(
        &self,
        chat_id: &str,
        message: ChatMessage,
    ) -> Result<bool, ChatAgentError> {
        self.modify(
            chat_id,
            Box::new(move |record| {
                if let Some(client_id) = message.client_message_id.as_deref() {
                    let duplicate = record
                        .messages
                        .iter()
                        .any(|existing| existing.client_message_id.as_deref() == Some(client_id));
                    if duplicate {
                        return false;
                    }
                }
                record.messages.push(message);
                true
            }),
        )
        .await
    }
}

#[derive(Debug, Default)]
pub struct MemoryChatStore {
    records: Mutex<HashMap<String, ChatRecord>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn load(&self, chat_id: &str) -> Result<Option<ChatRecord>, ChatAgentError> {
        Ok(self.records.lock().await.get(chat_id).cloned())
    }

    async fn modify(&self, chat_id: &str, change: RecordChange) -> Result<bool, ChatAgentError> {
        let mut records = self.records.lock().await;
        let mut record = records
            .get(chat_id)
            .cloned()
            .unwrap_or_else(|| ChatRecord::new(chat_id));
        if !change(&mut record) {
            return Ok(false);
        }
        record.updated_at = Utc::now();
        records.insert(chat_id.to_string(), record);
        Ok(true)
    }
}

/// One pretty-printed JSON document per chat under a directory.
#[derive(Debug)]
pub struct FileChatStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileChatStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ChatAgentError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|err| storage_error(&dir, err))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, chat_id: &str) -> PathBuf {
        self.dir.join(format!("{chat_id}.json"))
    }
}

fn storage_error(path: &Path, err: impl std::fmt::Display) -> ChatAgentError {
    ChatAgentError::StorageError {
        message: format!("{}: {err}", path.display()),
    }
}

#[async_trait]
impl ChatStore for FileChatStore {
    async fn load(&self, chat_id: &str) -> Result<Option<ChatRecord>, ChatAgentError> {
        let path = self.record_path(chat_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(storage_error(&path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| storage_error(&path, err))
    }

    async fn modify(&self, chat_id: &str, change: RecordChange) -> Result<bool, ChatAgentError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .load(chat_id)
            .await?
            .unwrap_or_else(|| ChatRecord::new(chat_id));
        if !change(&mut record) {
            return Ok(false);
        }
        record.updated_at = Utc::now();
        let path = self.record_path(chat_id);
        let body = serde_json::to_vec_pretty(&record).map_err(|err| storage_error(&path, err))?;
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, body)
            .await
            .map_err(|err| storage_error(&staging, err))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|err| storage_error(&path, err))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_client_message_ids_are_ignored() {
        let store = MemoryChatStore::new();
        let first = ChatMessage::user("hi", Some("m1".into()));
        assert!(store.append_message("c1", first.clone()).await.unwrap());
        assert!(!store.append_message("c1", first).await.unwrap());
        assert!(store
            .append_message("c1", ChatMessage::user("again", None))
            .await
            .unwrap());
        let record = store.load("c1").await.unwrap().unwrap();
        assert_eq!(record.messages.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileChatStore::new(dir.path()).unwrap());
        let writers = (0..16).map(|index| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .append_message("c1", ChatMessage::user(format!("m{index}"), None))
                    .await
                    .unwrap()
            })
        });
        for writer in writers.collect::<Vec<_>>() {
            assert!(writer.await.unwrap());
        }
        let record = store.load("c1").await.unwrap().unwrap();
        assert_eq!(record.messages.len(), 16);
    }

    #[tokio::test]
    async fn file_store_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChatStore::new(dir.path()).unwrap();
        assert!(store.load("c1").await.unwrap().is_none());

        store
            .set_snapshot("c1", Some(SnapshotHandle("snap_1".into())))
            .await
            .unwrap();
        store.set_model("c1", "openai-responses", "gpt-5.1").await.unwrap();
        store
            .append_message(
                "c1",
                ChatMessage::assistant(vec![TranscriptPart::Text { text: "done".into() }]),
            )
            .await
            .unwrap();

        let reopened = FileChatStore::new(dir.path()).unwrap();
        let record = reopened.load("c1").await.unwrap().unwrap();
        assert_eq!(record.snapshot_id, Some(SnapshotHandle("snap_1".into())));
        assert_eq!(record.model.as_deref(), Some("gpt-5.1"));
        assert_eq!(record.messages[0].content, "done");
        assert_eq!(record.messages[0].role, ChatRole::Assistant);
    }
}
