//! InMemoryStore - 開発用・テスト用の正本
//!
//! record は JSON として保存されるので、save していない変更は load に現れません。
//! `set_unavailable(true)` で書き込みを失敗させ、インフラ障害の伝播を試せます。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{FileId, TaskId};
use crate::error::StoreError;
use crate::ports::{FileRef, IdGenerator, ObjectStore, SystemClock, UlidGenerator};

#[derive(Default)]
struct StoreState {
    tasks: HashMap<TaskId, serde_json::Value>,
    files: HashMap<FileId, Vec<u8>>,
}

pub struct InMemoryStore {
    ids: Arc<dyn IdGenerator>,
    state: Mutex<StoreState>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(UlidGenerator::new(SystemClock)))
    }

    pub fn with_id_generator(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            ids,
            state: Mutex::new(StoreState::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every write fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn task_count(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".into()));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn save_task(
        &self,
        id: Option<TaskId>,
        record: serde_json::Value,
    ) -> Result<TaskId, StoreError> {
        self.check_writable()?;
        let id = id.unwrap_or_else(|| self.ids.generate_task_id());
        self.state.lock().await.tasks.insert(id, record);
        Ok(id)
    }

    async fn load_task(&self, id: TaskId) -> Result<serde_json::Value, StoreError> {
        self.state
            .lock()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn create_file(&self, name: &str, encoding: Option<&str>) -> Result<FileRef, StoreError> {
        self.check_writable()?;
        let id = self.ids.generate_file_id();
        self.state.lock().await.files.insert(id, Vec::new());
        Ok(FileRef {
            id,
            name: name.to_string(),
            encoding: encoding.map(str::to_string),
        })
    }

    async fn write_file(&self, id: FileId, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let file = state
            .files
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        *file = bytes;
        Ok(())
    }

    async fn append_file(&self, id: FileId, bytes: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let file = state
            .files
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        file.extend_from_slice(bytes);
        Ok(())
    }

    async fn read_file(&self, id: FileId) -> Result<Vec<u8>, StoreError> {
        self.state
            .lock()
            .await
            .files
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FileHandle;
    use serde_json::json;

    #[tokio::test]
    async fn save_assigns_id_once() {
        let store = InMemoryStore::new();
        let id = store.save_task(None, json!({ "n": 1 })).await.unwrap();
        let same = store.save_task(Some(id), json!({ "n": 2 })).await.unwrap();

        assert_eq!(id, same);
        assert_eq!(store.load_task(id).await.unwrap(), json!({ "n": 2 }));
        assert_eq!(store.task_count().await, 1);
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let store = InMemoryStore::new();
        let id = TaskId::from_ulid(ulid::Ulid::new());
        assert!(matches!(store.load_task(id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn unavailable_store_rejects_writes() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let err = store.save_task(None, json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn file_handle_disk_roundtrip_and_append() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("input.txt");
        std::fs::write(&src, "hello").unwrap();

        let file = store.create_file("copy.txt", Some("utf-8")).await.unwrap();
        let handle = FileHandle::new(Arc::clone(&store), file);
        handle.from_disk(&src).await.unwrap();

        let mut writer = handle.open_append();
        writer.write(b" world");
        writer.close().await.unwrap();
        assert_eq!(handle.read_text().await.unwrap(), "hello world");

        let out = tempfile::tempdir().unwrap();
        let written = handle.to_disk(out.path()).await.unwrap();
        assert_eq!(written, out.path().join("copy.txt"));
        assert_eq!(std::fs::read_to_string(written).unwrap(), "hello world");
    }
}
