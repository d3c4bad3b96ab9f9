//! Durable snapshots of the conversation log.
//!
//! Only settled messages are written, newest `retention` entries only.
//! Loading never fails: missing, empty or unreadable snapshots restore the
//! welcome message instead.

use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use config::PathManager;

use crate::conversation::welcome_message;
use crate::message::Message;

pub const STORAGE_KEY: &str = "assistant_chat_history";
pub const DEFAULT_RETENTION: usize = config::settings::DEFAULT_RETENTION_LIMIT;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn save(&self, messages: &[Message]) -> anyhow::Result<()>;

    async fn load(&self) -> Vec<Message>;

    async fn clear(&self) -> anyhow::Result<()>;
}

/// The persisted subset of `messages`: settled entries, most recent `retention`.
pub fn snapshot(messages: &[Message], retention: usize) -> Vec<Message> {
    let settled: Vec<&Message> = messages.iter().filter(|m| !m.is_streaming).collect();
    let skip = settled.len().saturating_sub(retention);
    settled.into_iter().skip(skip).cloned().collect()
}

fn encode(messages: &[Message], retention: usize) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&snapshot(messages, retention))?)
}

fn decode(raw: Option<&str>) -> Vec<Message> {
    let restored = match raw.map(serde_json::from_str::<Vec<Message>>) {
        None => Vec::new(),
        Some(Ok(messages)) => messages,
        Some(Err(e)) => {
            warn!(error = %e, "discarding unreadable conversation snapshot");
            Vec::new()
        }
    };
    if restored.is_empty() {
        vec![welcome_message()]
    } else {
        restored
    }
}

/// Snapshot stored as a JSON file, one file per storage scope.
#[derive(Debug, Clone)]
pub struct FileHistoryStore {
    path: PathBuf,
    retention: usize,
}

impl FileHistoryStore {
    pub fn new(dir: impl AsRef<Path>, scope: Option<&str>, retention: usize) -> Self {
        let file_name = match scope.map(sanitize_scope).filter(|s| !s.is_empty()) {
            Some(scope) => format!("{STORAGE_KEY}_{scope}.json"),
            None => format!("{STORAGE_KEY}.json"),
        };
        FileHistoryStore {
            path: dir.as_ref().join(file_name),
            retention,
        }
    }

    /// Store under the application's data directory.
    pub fn in_data_dir(scope: Option<&str>, retention: usize) -> anyhow::Result<Self> {
        let dir = PathManager::history_dir().context("Could not determine data directory")?;
        Ok(Self::new(dir, scope, retention))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn sanitize_scope(scope: &str) -> String {
    scope
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn save(&self, messages: &[Message]) -> anyhow::Result<()> {
        let content = encode(messages, self.retention)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), "conversation snapshot saved");
        Ok(())
    }

    async fn load(&self) -> Vec<Message> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Some(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read conversation snapshot");
                None
            }
        };
        decode(raw.as_deref())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

/// In-memory snapshot, serialized the same way as the file store.
#[derive(Debug)]
pub struct MemoryHistoryStore {
    raw: Mutex<Option<String>>,
    retention: usize,
}

impl MemoryHistoryStore {
    pub fn new(retention: usize) -> Self {
        MemoryHistoryStore {
            raw: Mutex::new(None),
            retention,
        }
    }

    /// Start from an arbitrary stored payload
    pub fn with_raw(raw: impl Into<String>, retention: usize) -> Self {
        MemoryHistoryStore {
            raw: Mutex::new(Some(raw.into())),
            retention,
        }
    }

    pub fn raw(&self) -> Option<String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.raw.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn save(&self, messages: &[Message]) -> anyhow::Result<()> {
        let content = encode(messages, self.retention)?;
        *self.lock() = Some(content);
        Ok(())
    }

    async fn load(&self) -> Vec<Message> {
        let raw = self.raw();
        decode(raw.as_deref())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        *self.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::WELCOME_MESSAGE;
    use crate::message::{MessageId, Product, Role};

    fn sample_log() -> Vec<Message> {
        vec![
            welcome_message(),
            Message::user(MessageId(2), "Show me cupcakes"),
            Message::product_list(
                MessageId(4),
                vec![Product {
                    name: "Vanilla Cupcake".to_string(),
                    price: 300.0,
                    category: "Cupcakes".to_string(),
                    description: Some("Buttercream".to_string()),
                }],
            ),
            Message::assistant(MessageId(3), "Here are our cupcakes."),
            Message::user(MessageId(5), "And donuts?"),
            Message::placeholder(MessageId(6)),
        ]
    }

    #[test]
    fn test_snapshot_drops_streaming_and_keeps_newest() {
        let log = sample_log();
        let all = snapshot(&log, 60);
        assert_eq!(all.len(), 5);
        assert!(all.iter().all(|m| !m.is_streaming));

        let newest = snapshot(&log, 2);
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].id, MessageId(3));
        assert_eq!(newest[1].id, MessageId(5));
    }

    #[tokio::test]
    async fn test_memory_roundtrip_preserves_settled_messages() {
        let store = MemoryHistoryStore::default();
        let log = sample_log();
        store.save(&log).await.unwrap();

        let raw = store.raw().unwrap();
        assert!(!raw.contains("is_streaming"));

        let restored = store.load().await;
        assert_eq!(restored, snapshot(&log, 60));
        assert_eq!(restored[2].role, Role::ProductList);
        assert_eq!(restored[2].products[0].description.as_deref(), Some("Buttercream"));
    }

    #[tokio::test]
    async fn test_load_defaults_to_welcome() {
        for store in [
            MemoryHistoryStore::default(),
            MemoryHistoryStore::with_raw("", 60),
            MemoryHistoryStore::with_raw("[]", 60),
            MemoryHistoryStore::with_raw("{\"not\": \"a list\"}", 60),
        ] {
            let restored = store.load().await;
            assert_eq!(restored.len(), 1);
            assert_eq!(restored[0].text(), WELCOME_MESSAGE);
        }
    }

    #[tokio::test]
    async fn test_retention_caps_snapshot() {
        let store = MemoryHistoryStore::new(60);
        let log: Vec<Message> = (1..=75)
            .map(|i| Message::user(MessageId(i), format!("msg {i}")))
            .collect();
        store.save(&log).await.unwrap();

        let restored = store.load().await;
        assert_eq!(restored.len(), 60);
        assert_eq!(restored[0].text(), "msg 16");
        assert_eq!(restored[59].text(), "msg 75");
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path().join("history"), Some("guest/../1"), 60);
        assert_eq!(
            store.path().file_name().unwrap().to_str().unwrap(),
            "assistant_chat_history_guest1.json"
        );

        let log = sample_log();
        store.save(&log).await.unwrap();
        assert_eq!(store.load().await, snapshot(&log, 60));

        store.clear().await.unwrap();
        assert!(!store.path().exists());
        assert_eq!(store.load().await[0].text(), WELCOME_MESSAGE);
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_survives_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path(), None, 60);
        std::fs::write(store.path(), "[{\"id\": 1, \"role\": \"wizard\"}]").unwrap();

        let restored = store.load().await;
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].text(), WELCOME_MESSAGE);
    }
}
