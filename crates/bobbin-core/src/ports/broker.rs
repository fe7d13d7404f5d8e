//! Broker port - 配送チャネル（task_id のみを流す）
//!
//! # 設計原則
//! - メッセージは `{"task_id": ...}` だけ（状態・payload は store に保存）
//! - at-least-once: settle されずに手放された delivery は再配送される
//! - receive は timeout 付きで、空なら `BrokerError::Empty` を返す

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{MessageId, TaskMessage};
use crate::error::BrokerError;

/// Outcome written back for a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(serde_json::Value),
    Exception(String),
}

/// A message still waiting in a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resident {
    pub id: MessageId,
    pub message: TaskMessage,
}

/// Per-delivery outcome handle.
///
/// Consuming either method acknowledges the delivery. Dropping the handle
/// without calling one releases the message back to the broker.
#[async_trait]
pub trait DeliveryOutcome: Send {
    async fn set_result(self: Box<Self>, value: serde_json::Value) -> Result<(), BrokerError>;

    async fn set_exception(self: Box<Self>, error: String) -> Result<(), BrokerError>;
}

/// A message handed to exactly one consumer.
pub struct Delivery {
    pub id: MessageId,
    pub message: TaskMessage,
    pub outcome: Box<dyn DeliveryOutcome>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait TaskChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Publish a message. With `no_reply` nobody waits on its outcome.
    async fn send(&self, message: TaskMessage, no_reply: bool) -> Result<MessageId, BrokerError>;

    /// Wait up to `timeout` for the next message.
    async fn receive(&self, timeout: Duration) -> Result<Delivery, BrokerError>;

    /// Snapshot of resident messages in delivery order.
    async fn resident(&self) -> Result<Vec<Resident>, BrokerError>;

    /// Settle a resident message without delivering it. Returns false when the
    /// message is no longer resident.
    async fn settle(&self, id: MessageId, outcome: Outcome) -> Result<bool, BrokerError>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn task_queue(&self, name: &str) -> Result<Arc<dyn TaskChannel>, BrokerError>;
}
