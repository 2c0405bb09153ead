//! Transcript Persistence
//!
//! Workers persist the serialized transcript after each processed message and
//! reload it on startup, so a restart resumes conversations mid-stream. The
//! store only moves opaque JSON blobs keyed by conversation; the transcript
//! owns the format.

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// Errors from a transcript store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem failure
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Keyed blob storage for serialized transcripts
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Fetch the blob for a conversation, if one was saved
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write (or overwrite) the blob for a conversation
    async fn put(&self, key: &str, blob: &str) -> Result<(), StoreError>;
}

// ============================================================================
// File Store
// ============================================================================

/// One JSON file per conversation under a data directory
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `dir`; the directory is created on first write
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Conversation keys contain channel separators; flatten them into a
    /// filesystem-safe name.
    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl TranscriptStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, blob: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path_for(key), blob).await?;
        tracing::trace!(%key, bytes = blob.len(), "persisted transcript");
        Ok(())
    }
}

// ============================================================================
// Memory Store
// ============================================================================

/// In-process store for tests and ephemeral deployments
#[derive(Default)]
pub struct MemoryStore {
    blobs: DashMap<String, String>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored transcripts
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl TranscriptStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.blobs.get(key).map(|entry| entry.clone()))
    }

    async fn put(&self, key: &str, blob: &str) -> Result<(), StoreError> {
        self.blobs.insert(key.to_string(), blob.to_string());
        Ok(())
    }
}
