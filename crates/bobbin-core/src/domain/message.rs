//! Wire message carried by broker channels.

use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// Result value written to a delivery outcome when a resident message is
/// detached by `remove`/`purge`.
pub const CANCELLED: &str = "cancelled";

/// The only thing a queue ever carries: a reference to a persisted task.
///
/// Payload, state and output live in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: TaskId,
}

impl TaskMessage {
    pub fn new(task_id: TaskId) -> Self {
        Self { task_id }
    }
}
