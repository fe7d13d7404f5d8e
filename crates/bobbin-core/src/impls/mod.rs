//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryStore**: ObjectStore
//! - **InMemoryBroker**: Broker / TaskChannel
//!
//! 本番用の store / broker 実装はこのクレートの外に置きます。

pub mod inmem_broker;
pub mod inmem_store;

pub use self::inmem_broker::{InMemoryBroker, InMemoryChannel};
pub use self::inmem_store::InMemoryStore;
