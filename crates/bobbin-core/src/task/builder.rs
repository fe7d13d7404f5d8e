use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Map, Value};

use super::Task;
use crate::command::{Command, CommandSpec};
use crate::error::{CommandError, TaskError};
use crate::observability::LogLevel;
use crate::session::Session;

/// Fluent construction of a `Task`.
///
/// ```ignore
/// let mut task = session
///     .task(Symbol::new("arith", "add"))
///     .arg(4)?
///     .arg(5)?
///     .folder("runs/add")
///     .build()
///     .await?;
/// ```
pub struct TaskBuilder {
    session: Session,
    spec: CommandSpec,
    kind: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    dynamic: bool,
    folder: String,
    files: Vec<PathBuf>,
    log_level: Option<Option<LogLevel>>,
}

fn to_value(value: impl Serialize, what: &str) -> Result<Value, CommandError> {
    serde_json::to_value(value).map_err(|e| CommandError::InvalidArgument(format!("{what}: {e}")))
}

impl TaskBuilder {
    pub(crate) fn new(session: Session, spec: CommandSpec) -> Self {
        Self {
            session,
            spec,
            kind: Command::FUNCTION.to_string(),
            args: Vec::new(),
            kwargs: Map::new(),
            dynamic: false,
            folder: String::new(),
            files: Vec::new(),
            log_level: None,
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn arg(mut self, value: impl Serialize) -> Result<Self, CommandError> {
        let position = self.args.len();
        self.args.push(to_value(value, &format!("argument {position}"))?);
        Ok(self)
    }

    pub fn args(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values);
        self
    }

    pub fn kwarg(mut self, name: &str, value: impl Serialize) -> Result<Self, CommandError> {
        let value = to_value(value, &format!("keyword '{name}'"))?;
        self.kwargs.insert(name.to_string(), value);
        Ok(self)
    }

    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = folder.into();
        self
    }

    /// A file to store with the task and copy into its folder before running.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    /// Override the session's default; `None` disables log capture.
    pub fn log_level(mut self, level: Option<LogLevel>) -> Self {
        self.log_level = Some(level);
        self
    }

    pub async fn build(self) -> Result<Task, TaskError> {
        let command = Command::of_kind(
            &self.session,
            &self.kind,
            self.spec,
            self.args,
            self.kwargs,
            self.dynamic,
        )
        .await?;
        let mut task = Task::new(&self.session, command, self.folder).await?;
        if let Some(level) = self.log_level {
            task.set_log_level(level);
        }
        for path in &self.files {
            task.add_file(path).await?;
        }
        Ok(task)
    }
}
