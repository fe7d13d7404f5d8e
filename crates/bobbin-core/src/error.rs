//! Error types shared across the crate.
//!
//! 分類:
//! - 仕様エラー（`CommandError` の build 系）: build 時に fail-fast、queue には届かない
//! - 実行エラー（`TaskError::is_execution`）: `Task.error` に記録され lease 境界で吸収される
//! - 空キュー（`QueueError::Empty`）: エラーではなくポーリング停止のシグナル
//! - インフラ障害（store / broker）: 呼び出し元にそのまま伝播する

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::domain::State;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("record codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Nothing arrived within the receive timeout.
    #[error("no message on '{queue}' within {timeout:?}")]
    Empty { queue: String, timeout: Duration },

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unsupported command spec '{0}'")]
    UnsupportedCommandSpec(String),

    #[error("unknown command kind '{0}'")]
    UnknownCommandKind(String),

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("symbol '{symbol}' not found in module '{module}'")]
    UnknownSymbol { module: String, symbol: String },

    #[error("no interpreter registered for script '{0}'")]
    NoInterpreter(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Raised by the invoked callable itself.
    #[error("{0}")]
    Raised(String),

    #[error("{script}@{symbol} exited with {status}: {message}")]
    Script {
        script: String,
        symbol: String,
        status: String,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CommandError {
    /// Convenience for native callables: `Err(CommandError::raised("boom"))`.
    pub fn raised(message: impl Into<String>) -> Self {
        CommandError::Raised(message.into())
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("preparing folder {path}: {source}")]
    Folder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] Box<QueueError>),
}

impl TaskError {
    /// Errors raised by executing the task's own work (as opposed to the
    /// store or broker failing underneath it).
    pub fn is_execution(&self) -> bool {
        match self {
            TaskError::Command(CommandError::Store(_)) => false,
            TaskError::Command(_) | TaskError::Folder { .. } => true,
            TaskError::InvalidTransition { .. } | TaskError::Store(_) | TaskError::Queue(_) => {
                false
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// Normal termination signal for polling loops.
    #[error("queue '{queue}' is empty")]
    Empty { queue: String },

    #[error(transparent)]
    Broker(BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

impl QueueError {
    pub fn is_empty(&self) -> bool {
        matches!(self, QueueError::Empty { .. })
    }
}

impl From<BrokerError> for QueueError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Empty { queue, .. } => QueueError::Empty { queue },
            other => QueueError::Broker(other),
        }
    }
}
