//! Task - 永続化されるジョブレコードと状態機械
//!
//! # 学習ポイント
//! - 状態の変更は必ず `State::can_transition_to` を通し、直後に store へ保存する
//! - `run()` は成功・失敗・インフラ障害のどの経路でも出力を flush して保存する
//! - 作業ディレクトリは `ExecContext` で明示的に渡す（プロセスの cwd は変更しない）

mod builder;
mod capture;

pub use builder::TaskBuilder;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use self::capture::Capture;
use crate::command::{Command, ExecContext};
use crate::domain::{State, TaskId};
use crate::error::{CommandError, StoreError, TaskError};
use crate::observability::LogLevel;
use crate::ports::{FileHandle, FileRef};
use crate::session::Session;

/// What the store holds for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub command: Command,
    /// Relative to the session work dir unless absolute; empty is the work dir.
    pub folder: String,
    pub files: Vec<FileRef>,
    pub state: State,
    pub error: Option<String>,
    pub queue: Option<String>,
    pub log_level: Option<LogLevel>,
    pub log: FileRef,
    pub stdout: FileRef,
    pub stderr: FileRef,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task bound to the session that persists it.
#[derive(Clone)]
pub struct Task {
    session: Session,
    id: Option<TaskId>,
    record: TaskRecord,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("record", &self.record)
            .finish()
    }
}

impl Task {
    /// New task in `Created`. Not persisted until the first save.
    pub async fn new(
        session: &Session,
        command: Command,
        folder: impl Into<String>,
    ) -> Result<Self, TaskError> {
        let store = session.store();
        let log = store.create_file("task.log", Some("utf-8")).await?;
        let stdout = store.create_file("stdout.txt", Some("utf-8")).await?;
        let stderr = store.create_file("stderr.txt", Some("utf-8")).await?;
        let now = session.clock().now();

        Ok(Self {
            session: session.clone(),
            id: None,
            record: TaskRecord {
                command,
                folder: folder.into(),
                files: Vec::new(),
                state: State::Created,
                error: None,
                queue: None,
                log_level: session.config().log_level,
                log,
                stdout,
                stderr,
                created_at: now,
                updated_at: now,
            },
        })
    }

    pub async fn load(session: &Session, id: TaskId) -> Result<Self, TaskError> {
        let value = session.store().load_task(id).await?;
        let record = serde_json::from_value(value).map_err(StoreError::from)?;
        Ok(Self {
            session: session.clone(),
            id: Some(id),
            record,
        })
    }

    pub fn id(&self) -> Option<TaskId> {
        self.id
    }

    pub fn state(&self) -> State {
        self.record.state
    }

    pub fn error(&self) -> Option<&str> {
        self.record.error.as_deref()
    }

    pub fn queue(&self) -> Option<&str> {
        self.record.queue.as_deref()
    }

    pub fn command(&self) -> &Command {
        &self.record.command
    }

    pub fn folder(&self) -> &str {
        &self.record.folder
    }

    pub fn files(&self) -> &[FileRef] {
        &self.record.files
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        self.record.log_level
    }

    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    pub fn set_log_level(&mut self, level: Option<LogLevel>) {
        self.record.log_level = level;
    }

    /// Absolute folder the command runs in.
    pub fn folder_path(&self) -> PathBuf {
        self.session.resolve_folder(&self.record.folder)
    }

    /// Persist the record, assigning an id on first save.
    pub async fn save(&mut self) -> Result<TaskId, TaskError> {
        self.record.updated_at = self.session.clock().now();
        let value = serde_json::to_value(&self.record).map_err(StoreError::from)?;
        let id = self.session.store().save_task(self.id, value).await?;
        self.id = Some(id);
        Ok(id)
    }

    /// Replace local fields with the last persisted record.
    pub async fn reload(&mut self) -> Result<(), TaskError> {
        let Some(id) = self.id else {
            return Ok(());
        };
        let value = self.session.store().load_task(id).await?;
        self.record = serde_json::from_value(value).map_err(StoreError::from)?;
        Ok(())
    }

    /// Validate and apply a state change without saving.
    pub(crate) fn transition(&mut self, next: State) -> Result<(), TaskError> {
        let current = self.record.state;
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        self.record.state = next;
        Ok(())
    }

    /// Change state and persist immediately. Re-setting the current state
    /// only saves.
    pub async fn set_state(&mut self, next: State) -> Result<(), TaskError> {
        self.transition(next)?;
        self.save().await?;
        Ok(())
    }

    pub(crate) fn set_queue(&mut self, queue: Option<String>) {
        self.record.queue = queue;
    }

    /// Put back a record taken with `record().clone()`. Not saved.
    pub(crate) fn restore(&mut self, record: TaskRecord) {
        self.record = record;
    }

    pub(crate) fn clear_error(&mut self) {
        self.record.error = None;
    }

    /// Store a file from disk and attach it to the task.
    pub async fn add_file(&mut self, path: impl AsRef<Path>) -> Result<FileRef, TaskError> {
        let path = self.session.work_dir().join(path.as_ref());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let store = Arc::clone(self.session.store());
        let file = store.create_file(&name, None).await?;
        FileHandle::new(store, file.clone()).from_disk(&path).await?;
        self.record.files.push(file.clone());
        if self.id.is_some() {
            self.save().await?;
        }
        Ok(file)
    }

    /// Materialize the command snapshot and attached files in `dir`.
    pub async fn copy_files_to(&self, dir: &Path) -> Result<Vec<PathBuf>, TaskError> {
        let mut written = Vec::new();
        let command = self
            .record
            .command
            .copy_files_to(&self.session, dir)
            .await
            .map_err(|err| match err {
                CommandError::Store(err) => folder_error(err),
                other => TaskError::Command(other),
            })?;
        written.extend(command);

        for file in &self.record.files {
            let handle = FileHandle::new(Arc::clone(self.session.store()), file.clone());
            written.push(handle.to_disk(dir).await.map_err(folder_error)?);
        }
        Ok(written)
    }

    /// Run the command in the task folder.
    ///
    /// Captured output is appended to the task's files and the task is saved
    /// on every exit path. Execution errors leave the task `Failed` with its
    /// error recorded; store failures propagate as they are.
    pub async fn run(&mut self) -> Result<Value, TaskError> {
        let config = self.session.config();
        let capture = Capture::new(self.record.log_level, config.echo_output);
        let ctx = ExecContext {
            workdir: self.folder_path(),
            stdout: capture.stdout.clone(),
            stderr: capture.stderr.clone(),
        };

        let outcome = capture.scope(self.execute(&ctx)).await;

        let store = Arc::clone(self.session.store());
        let flushed = capture
            .flush(
                store.as_ref(),
                &self.record.log,
                &self.record.stdout,
                &self.record.stderr,
            )
            .await;
        let saved = self.save().await;
        flushed?;
        saved?;
        outcome
    }

    async fn execute(&mut self, ctx: &ExecContext) -> Result<Value, TaskError> {
        self.set_state(State::Running).await?;
        let label = self.label();
        info!(task_id = %label, command = %self.record.command, "starting task");

        match self.prepare_and_call(ctx).await {
            Ok(value) => {
                self.set_state(State::Done).await?;
                info!(task_id = %label, "task done");
                Ok(value)
            }
            Err(err) if err.is_execution() => {
                error!(task_id = %label, "task {label} failed: {err}");
                self.record.error = Some(err.to_string());
                self.set_state(State::Failed).await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn prepare_and_call(&self, ctx: &ExecContext) -> Result<Value, TaskError> {
        tokio::fs::create_dir_all(&ctx.workdir)
            .await
            .map_err(|source| TaskError::Folder {
                path: ctx.workdir.clone(),
                source,
            })?;
        self.copy_files_to(&ctx.workdir).await?;
        Ok(self.record.command.run(&self.session, ctx).await?)
    }

    /// Submit again to `queue` (or the queue it last belonged to).
    ///
    /// Returns false without side effects for a task that never had a queue,
    /// and false after a reload when the queue already holds a reference.
    pub async fn resubmit(&mut self, queue: Option<&str>) -> Result<bool, TaskError> {
        let Some(current) = self.record.queue.clone() else {
            return Ok(false);
        };
        let target = queue.map(str::to_string).unwrap_or(current);
        self.clear_error();

        let submitted = match self.session.queue(&target).await {
            Ok(target) => target.submit(self).await,
            Err(err) => Err(err),
        };
        match submitted {
            Ok(Some(_)) => Ok(true),
            Ok(None) => {
                self.reload().await?;
                Ok(false)
            }
            Err(err) => {
                self.reload().await?;
                Err(TaskError::Queue(Box::new(err)))
            }
        }
    }

    pub async fn log_text(&self) -> Result<String, TaskError> {
        self.read_text(&self.record.log).await
    }

    pub async fn stdout_text(&self) -> Result<String, TaskError> {
        self.read_text(&self.record.stdout).await
    }

    pub async fn stderr_text(&self) -> Result<String, TaskError> {
        self.read_text(&self.record.stderr).await
    }

    async fn read_text(&self, file: &FileRef) -> Result<String, TaskError> {
        let handle = FileHandle::new(Arc::clone(self.session.store()), file.clone());
        Ok(handle.read_text().await?)
    }

    fn label(&self) -> String {
        self.id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "(unsaved)".to_string())
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state={}", self.record.state)?;
        if let Some(error) = &self.record.error {
            write!(f, " [{error}]")?;
        }
        Ok(())
    }
}

fn folder_error(err: StoreError) -> TaskError {
    match err {
        StoreError::Io { path, source } => TaskError::Folder { path, source },
        other => TaskError::Store(other),
    }
}
