//! Knowledge store: where finished sessions leave a summary.
//!
//! The orchestrator calls [`KnowledgeStore::add_document`] once per
//! finalized session. Store failures are logged by the caller and never
//! affect session completion.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Failure writing or reading a knowledge document.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize failed: {0}")]
    Serialize(String),
}

/// One stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    /// Schema version for forward compatibility.
    pub version: u32,
    pub key: String,
    pub text: String,
    pub metadata: serde_json::Value,
    pub stored_at: DateTime<Utc>,
}

impl KnowledgeDocument {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(key: &str, text: &str, metadata: serde_json::Value) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            key: key.to_string(),
            text: text.to_string(),
            metadata,
            stored_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn add_document(
        &self,
        key: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError>;
}

/// Keeps documents in memory. Useful for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryKnowledgeStore {
    docs: Mutex<Vec<KnowledgeDocument>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self) -> Vec<KnowledgeDocument> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, key: &str) -> Option<KnowledgeDocument> {
        self.docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|d| d.key == key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn add_document(
        &self,
        key: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(KnowledgeDocument::new(key, text, metadata));
        Ok(())
    }
}

/// Append-only JSON-lines file, one document per line.
#[derive(Debug)]
pub struct JsonlKnowledgeStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlKnowledgeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every document back. Unparseable lines are skipped with a warning.
    pub async fn read_all(&self) -> Result<Vec<KnowledgeDocument>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut docs = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<KnowledgeDocument>(line) {
                Ok(doc) => docs.push(doc),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping corrupted knowledge document"
                ),
            }
        }
        Ok(docs)
    }
}

#[async_trait]
impl KnowledgeStore for JsonlKnowledgeStore {
    async fn add_document(
        &self,
        key: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        let doc = KnowledgeDocument::new(key, text, metadata);
        let mut line =
            serde_json::to_string(&doc).map_err(|e| StoreError::Serialize(e.to_string()))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryKnowledgeStore::new();
        assert!(store.is_empty());
        store
            .add_document("s-1", "summary", serde_json::json!({"rounds": 2}))
            .await
            .unwrap();
        let doc = store.get("s-1").unwrap();
        assert_eq!(doc.text, "summary");
        assert_eq!(doc.metadata["rounds"], 2);
        assert_eq!(doc.version, KnowledgeDocument::CURRENT_VERSION);
    }

    #[tokio::test]
    async fn test_jsonl_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlKnowledgeStore::new(dir.path().join("nested/knowledge.jsonl"));
        assert!(store.read_all().await.unwrap().is_empty());

        store
            .add_document("a", "first", serde_json::json!({}))
            .await
            .unwrap();
        store
            .add_document("b", "second\nwith newline", serde_json::json!({"q": 80.0}))
            .await
            .unwrap();

        let docs = store.read_all().await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].key, "a");
        assert_eq!(docs[1].text, "second\nwith newline");
    }

    #[tokio::test]
    async fn test_jsonl_skips_corrupted_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.jsonl");
        let store = JsonlKnowledgeStore::new(&path);
        store
            .add_document("ok", "fine", serde_json::json!(null))
            .await
            .unwrap();
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{not json\n");
        std::fs::write(&path, raw).unwrap();

        let docs = store.read_all().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].key, "ok");
    }
}
