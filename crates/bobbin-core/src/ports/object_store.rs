//! ObjectStore port - task record と file artifact の正本（source of truth）
//!
//! Queue は task_id しか運ばないので、状態・エラー・出力はすべてここに保存されます。
//! 本番実装（document store など）は別クレートに置く想定で、
//! このクレートには `impls::InMemoryStore` だけを含めます。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{FileId, TaskId};
use crate::error::StoreError;

/// Persisted reference to a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub id: FileId,
    /// File name used when the file is materialized on disk.
    pub name: String,
    pub encoding: Option<String>,
}

/// Durable object persistence.
///
/// Records are opaque JSON documents to the store. `save_task` with `None`
/// assigns a fresh id; with `Some(id)` it overwrites that record.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn save_task(
        &self,
        id: Option<TaskId>,
        record: serde_json::Value,
    ) -> Result<TaskId, StoreError>;

    async fn load_task(&self, id: TaskId) -> Result<serde_json::Value, StoreError>;

    async fn create_file(&self, name: &str, encoding: Option<&str>) -> Result<FileRef, StoreError>;

    /// Replace the file contents.
    async fn write_file(&self, id: FileId, bytes: Vec<u8>) -> Result<(), StoreError>;

    async fn append_file(&self, id: FileId, bytes: &[u8]) -> Result<(), StoreError>;

    async fn read_file(&self, id: FileId) -> Result<Vec<u8>, StoreError>;
}

/// A `FileRef` bound to the store that holds it.
pub struct FileHandle {
    store: Arc<dyn ObjectStore>,
    file: FileRef,
}

impl FileHandle {
    pub fn new(store: Arc<dyn ObjectStore>, file: FileRef) -> Self {
        Self { store, file }
    }

    pub fn file(&self) -> &FileRef {
        &self.file
    }

    /// Replace the contents with the file at `path`.
    pub async fn from_disk(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.store.write_file(self.file.id, bytes).await
    }

    /// Write the contents to `dir/<name>` and return that path.
    pub async fn to_disk(&self, dir: impl AsRef<Path>) -> Result<PathBuf, StoreError> {
        let target = dir.as_ref().join(&self.file.name);
        let bytes = self.store.read_file(self.file.id).await?;
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: target.clone(),
                source,
            })?;
        Ok(target)
    }

    pub async fn read_text(&self) -> Result<String, StoreError> {
        let bytes = self.store.read_file(self.file.id).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Open the file in append mode. Nothing reaches the store until `close`.
    pub fn open_append(&self) -> FileWriter {
        FileWriter {
            store: Arc::clone(&self.store),
            id: self.file.id,
            buffer: Vec::new(),
        }
    }
}

/// Buffered append stream returned by `FileHandle::open_append`.
pub struct FileWriter {
    store: Arc<dyn ObjectStore>,
    id: FileId,
    buffer: Vec<u8>,
}

impl FileWriter {
    pub fn write(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub async fn close(self) -> Result<(), StoreError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.store.append_file(self.id, &self.buffer).await
    }
}
