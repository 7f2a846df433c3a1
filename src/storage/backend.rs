//! State backend implementations.

use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// The logical documents the engine persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Document {
    /// Cache table keyed by fingerprint.
    Responses,
    /// Pending requests and in-flight batch groups.
    BatchState,
}

impl Document {
    pub fn file_name(&self) -> &'static str {
        match self {
            Document::Responses => "responses.json",
            Document::BatchState => "batch-state.json",
        }
    }
}

#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Returns `None` when the document has never been written.
    async fn read(&self, doc: Document) -> Result<Option<Vec<u8>>>;
    async fn write(&self, doc: Document, data: &[u8]) -> Result<()>;
    async fn remove(&self, doc: Document) -> Result<bool>;
    fn name(&self) -> &'static str;
}

/// One JSON file per document under a directory.
///
/// Writes land in a sibling temp file first and are renamed over the target,
/// so a crash mid-write leaves the previous document intact.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, doc: Document) -> PathBuf {
        self.dir.join(doc.file_name())
    }

    fn io_error(&self, doc: Document, op: &str, e: std::io::Error) -> Error {
        Error::storage_with_context(
            format!("{} failed: {}", op, e),
            ErrorContext::new()
                .with_field_path(self.path_for(doc).display().to_string())
                .with_source("file_backend"),
        )
    }
}

#[async_trait]
impl StateBackend for FileBackend {
    async fn read(&self, doc: Document) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(doc)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(doc, "read", e)),
        }
    }

    async fn write(&self, doc: Document, data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.io_error(doc, "create_dir", e))?;
        let target = self.path_for(doc);
        let tmp = target.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| self.io_error(doc, "write", e))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| self.io_error(doc, "rename", e))
    }

    async fn remove(&self, doc: Document) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(doc)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(doc, "remove", e)),
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// In-process documents. State survives engine restarts that share the backend.
pub struct MemoryBackend {
    docs: RwLock<HashMap<Document, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
        }
    }

    fn poisoned() -> Error {
        Error::storage_with_context(
            "memory backend lock poisoned",
            ErrorContext::new().with_source("memory_backend"),
        )
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn read(&self, doc: Document) -> Result<Option<Vec<u8>>> {
        let docs = self.docs.read().map_err(|_| Self::poisoned())?;
        Ok(docs.get(&doc).cloned())
    }

    async fn write(&self, doc: Document, data: &[u8]) -> Result<()> {
        let mut docs = self.docs.write().map_err(|_| Self::poisoned())?;
        docs.insert(doc, data.to_vec());
        Ok(())
    }

    async fn remove(&self, doc: Document) -> Result<bool> {
        let mut docs = self.docs.write().map_err(|_| Self::poisoned())?;
        Ok(docs.remove(&doc).is_some())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Discards writes and loads nothing.
pub struct NullBackend;

impl NullBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateBackend for NullBackend {
    async fn read(&self, _: Document) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
    async fn write(&self, _: Document, _: &[u8]) -> Result<()> {
        Ok(())
    }
    async fn remove(&self, _: Document) -> Result<bool> {
        Ok(false)
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
