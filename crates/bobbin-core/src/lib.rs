//! bobbin-core
//!
//! Durable task queue building blocks.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, wire message）
//! - **ports**: 抽象化レイヤー（ObjectStore, Broker, Clock, IdGenerator）
//! - **impls**: 開発用・テスト用の実装（InMemoryStore, InMemoryBroker）
//! - **command**: 実行するコードの解決（function / method / module / `path@symbol`）
//! - **task**: 永続化される task と状態機械、`run()`
//! - **queue**: submit / next_task (lease) / remove / purge
//! - **worker**: worker ループと WorkerGroup
//! - **session**: config・store・broker・module registry をまとめた実行コンテキスト
//! - **config** / **observability** / **error**: 横断的な関心事

pub mod command;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod session;
pub mod task;
pub mod worker;

pub use command::{Command, CommandSpec, Module, ModuleRegistry, Symbol};
pub use config::Config;
pub use domain::{State, TaskId};
pub use error::{CommandError, QueueError, TaskError};
pub use queue::{LeaseOutcome, Queue, TaskLease};
pub use session::{Session, SessionBuilder, SessionError};
pub use task::{Task, TaskBuilder};
pub use worker::WorkerGroup;
