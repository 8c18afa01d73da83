//! Saved conversations, kept as one JSON array in a single file.
//!
//! The file is always read and rewritten wholesale; writes go to a temp file
//! in the same directory which is then renamed over the target.

use crate::constants::CONVERSATION_TITLE_CHARS;
use crate::consumer::Message;
use crate::str_utils;
use crate::types::{ConversationId, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    pub messages: Vec<Message>,
    /// Unix milliseconds
    pub created_at: i64,
    pub updated_at: i64,
}

pub fn conversation_title(messages: &[Message]) -> String {
    let Some(first) = messages.first() else {
        return String::new();
    };
    let prefix = str_utils::prefix_chars(&first.content, CONVERSATION_TITLE_CHARS);
    if prefix.len() < first.content.len() {
        format!("{}...", prefix)
    } else {
        prefix.to_string()
    }
}

pub struct ConversationStore {
    path: PathBuf,
}

impl ConversationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty store. An unreadable one is logged and
    /// treated as empty so the client can still start.
    pub fn load(&self) -> Result<Vec<ConversationRecord>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&text) {
            Ok(records) => Ok(records),
            Err(e) => {
                tracing::warn!(
                    "Ignoring corrupt conversation store {}: {}",
                    self.path.display(),
                    e
                );
                Ok(Vec::new())
            }
        }
    }

    fn save_all(&self, records: &[ConversationRecord]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        let json = serde_json::to_vec_pretty(records)?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn get(&self, id: &ConversationId) -> Result<Option<ConversationRecord>> {
        Ok(self.load()?.into_iter().find(|r| &r.id == id))
    }

    /// Most recently updated first.
    pub fn list(&self) -> Result<Vec<ConversationRecord>> {
        let mut records = self.load()?;
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    /// Inserts or replaces a conversation, keeping the original `createdAt`.
    /// Empty conversations are not stored.
    pub fn upsert(
        &self,
        id: &ConversationId,
        messages: &[Message],
    ) -> Result<Option<ConversationRecord>> {
        if messages.is_empty() {
            return Ok(None);
        }
        let now = chrono::Utc::now().timestamp_millis();
        let mut records = self.load()?;

        let record = match records.iter_mut().find(|r| &r.id == id) {
            Some(existing) => {
                existing.title = conversation_title(messages);
                existing.messages = messages.to_vec();
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let record = ConversationRecord {
                    id: id.clone(),
                    title: conversation_title(messages),
                    messages: messages.to_vec(),
                    created_at: now,
                    updated_at: now,
                };
                records.push(record.clone());
                record
            }
        };

        self.save_all(&records)?;
        tracing::debug!("Saved conversation {} ({} messages)", id.short(), messages.len());
        Ok(Some(record))
    }

    pub fn delete(&self, id: &ConversationId) -> Result<bool> {
        let mut records = self.load()?;
        let before = records.len();
        records.retain(|r| &r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.save_all(&records)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn test_title_truncates_on_char_boundary() {
        let long = "é".repeat(60);
        let title = conversation_title(&[Message::new(Role::User, long)]);
        assert_eq!(title.chars().count(), 53);
        assert!(title.ends_with("..."));

        let short = conversation_title(&[Message::new(Role::User, "Show me sales")]);
        assert_eq!(short, "Show me sales");
        assert_eq!(conversation_title(&[]), "");
    }

    #[test]
    fn test_upsert_preserves_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join("conversations.json"));
        let id = ConversationId::from("c1".to_string());

        let first = store
            .upsert(&id, &[Message::new(Role::User, "hello")])
            .unwrap()
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store
            .upsert(
                &id,
                &[
                    Message::new(Role::User, "hello"),
                    Message::new(Role::Assistant, "hi"),
                ],
            )
            .unwrap()
            .unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(store.load().unwrap().len(), 1);
        assert_eq!(store.get(&id).unwrap().unwrap().messages.len(), 2);
    }

    #[test]
    fn test_empty_conversation_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join("conversations.json"));
        let id = ConversationId::new();
        assert!(store.upsert(&id, &[]).unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_delete_and_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.json");
        let store = ConversationStore::new(&path);
        let id = ConversationId::new();
        store.upsert(&id, &[Message::new(Role::User, "x")]).unwrap();

        assert!(store.delete(&id).unwrap());
        assert!(!store.delete(&id).unwrap());
        assert!(store.load().unwrap().is_empty());

        std::fs::write(&path, "not json").unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_wire_uses_camel_case_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.json");
        let store = ConversationStore::new(&path);
        store
            .upsert(&ConversationId::new(), &[Message::new(Role::User, "x")])
            .unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw[0].get("createdAt").is_some());
        assert!(raw[0].get("updatedAt").is_some());
    }
}
