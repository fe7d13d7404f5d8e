//! Session - 実行コンテキスト（config / store / broker / module registry）
//!
//! # 学習ポイント
//! - グローバルな「現在のプロジェクト」の代わりに、明示的なコンテキストを引き回す
//! - Builder パターン + 起動時検証（Fail-fast 設計）
//! - `Arc` で包んで安価に clone（Queue / Task / worker がそれぞれ保持する）

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::command::{CommandSpec, Module, ModuleRegistry, RegistryError};
use crate::config::Config;
use crate::domain::TaskId;
use crate::error::{QueueError, TaskError};
use crate::impls::{InMemoryBroker, InMemoryStore};
use crate::ports::{Broker, Clock, ObjectStore, SystemClock};
use crate::queue::Queue;
use crate::task::{Task, TaskBuilder};

struct Inner {
    config: Config,
    store: Arc<dyn ObjectStore>,
    broker: Arc<dyn Broker>,
    registry: Arc<ModuleRegistry>,
    clock: Arc<dyn Clock>,
}

/// Session は Queue と Task が共有するコンテキスト
///
/// # 使用例
/// ```ignore
/// let session = Session::builder()
///     .config(Config::from_env()?)
///     .store(store)
///     .broker(broker)
///     .module(arith)?
///     .expect_modules(&["arith"])
///     .build()?;
/// let queue = session.default_queue().await?;
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("project", &self.inner.config.project)
            .field("work_dir", &self.inner.config.work_dir)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// In-memory store and broker with default config.
    pub fn in_memory(registry: ModuleRegistry) -> Self {
        Self::from_parts(
            Config::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryBroker::new()),
            Arc::new(registry),
            Arc::new(SystemClock),
        )
    }

    fn from_parts(
        config: Config,
        store: Arc<dyn ObjectStore>,
        broker: Arc<dyn Broker>,
        registry: Arc<ModuleRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                broker,
                registry,
                clock,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.inner.store
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.inner.registry
    }

    pub fn clock(&self) -> &dyn Clock {
        self.inner.clock.as_ref()
    }

    pub fn work_dir(&self) -> &Path {
        &self.inner.config.work_dir
    }

    /// Task folders are relative to the work dir; empty means the work dir itself.
    pub fn resolve_folder(&self, folder: &str) -> PathBuf {
        if folder.is_empty() {
            self.work_dir().to_path_buf()
        } else {
            self.work_dir().join(folder)
        }
    }

    pub async fn queue(&self, name: &str) -> Result<Queue, QueueError> {
        let channel = self.inner.broker.task_queue(name).await?;
        Ok(Queue::new(self.clone(), name, channel))
    }

    pub async fn default_queue(&self) -> Result<Queue, QueueError> {
        self.queue(&self.inner.config.default_queue).await
    }

    /// Start building a task around `spec`.
    pub fn task(&self, spec: impl Into<CommandSpec>) -> TaskBuilder {
        TaskBuilder::new(self.clone(), spec.into())
    }

    pub async fn load_task(&self, id: TaskId) -> Result<Task, TaskError> {
        Task::load(self, id).await
    }
}

/// SessionError は Session 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no object store configured")]
    MissingStore,

    #[error("no broker configured")]
    MissingBroker,

    #[error("Missing modules: {0:?}. These modules were expected but not registered.")]
    MissingModules(Vec<String>),
}

/// SessionBuilder は Session を構築
///
/// # Fail-fast 設計
/// - expect_modules() で期待されるモジュール名を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - store / broker が無ければ build() がエラーを返す
pub struct SessionBuilder {
    config: Config,
    store: Option<Arc<dyn ObjectStore>>,
    broker: Option<Arc<dyn Broker>>,
    registry: Arc<ModuleRegistry>,
    clock: Arc<dyn Clock>,
    expected_modules: Option<Vec<String>>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            store: None,
            broker: None,
            registry: Arc::new(ModuleRegistry::new()),
            clock: Arc::new(SystemClock),
            expected_modules: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// In-memory store and broker, for tests and the demo binary.
    pub fn in_memory(self) -> Self {
        self.store(Arc::new(InMemoryStore::new()))
            .broker(Arc::new(InMemoryBroker::new()))
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share an existing registry (e.g. to `replace` modules later).
    pub fn registry(mut self, registry: Arc<ModuleRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn module(self, module: Module) -> Result<Self, RegistryError> {
        self.registry.register(module)?;
        Ok(self)
    }

    pub fn expect_modules(mut self, names: &[&str]) -> Self {
        self.expected_modules = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Session, SessionError> {
        if let Some(expected) = &self.expected_modules {
            let registered = self.registry.registered_modules();
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !registered.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(SessionError::MissingModules(missing));
            }
        }
        let store = self.store.ok_or(SessionError::MissingStore)?;
        let broker = self.broker.ok_or(SessionError::MissingBroker)?;
        Ok(Session::from_parts(
            self.config,
            store,
            broker,
            self.registry,
            self.clock,
        ))
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
