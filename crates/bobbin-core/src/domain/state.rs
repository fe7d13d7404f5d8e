//! State - タスクの状態と遷移表
//!
//! 状態の代入は必ず `can_transition_to` を通します。
//! 不正な遷移（例: Done -> Running）はデータ破損ではなく `InvalidTransition` エラーになります。

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a task.
///
/// ```text
/// Created -> Queued -> Processing -> Running -> Done | Failed | Timeout | Memory
///               |                                  |
///               +-> Canceled                       +-- (terminal) -> Queued  (resubmit)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Initial state, set at construction.
    Created,
    /// A reference is resident in a queue.
    Queued,
    /// Reserved: parked in a queue without being eligible for pickup.
    Held,
    /// Received by a worker, `run()` not yet started.
    Processing,
    Running,
    Done,
    Failed,
    /// Detached from a queue before a worker picked it up.
    Canceled,
    /// Set by an external supervisor.
    Timeout,
    /// Set by an external supervisor.
    Memory,
}

impl State {
    pub const ALL: [State; 10] = [
        State::Created,
        State::Queued,
        State::Held,
        State::Processing,
        State::Running,
        State::Done,
        State::Failed,
        State::Canceled,
        State::Timeout,
        State::Memory,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Done | State::Failed | State::Canceled | State::Timeout | State::Memory
        )
    }

    /// Whether `self -> next` is a legal edge.
    ///
    /// Re-entering the current state is not an edge; callers treat it as a no-op.
    pub fn can_transition_to(self, next: State) -> bool {
        use State::*;
        match (self, next) {
            (Created, Queued) | (Created, Running) => true,
            (Queued, Processing) | (Queued, Canceled) | (Queued, Held) => true,
            (Held, Queued) | (Held, Canceled) => true,
            (Processing, Running) => true,
            (Running, Done) | (Running, Failed) | (Running, Timeout) | (Running, Memory) => true,
            (from, Queued) => from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Created => "created",
            State::Queued => "queued",
            State::Held => "held",
            State::Processing => "processing",
            State::Running => "running",
            State::Done => "done",
            State::Failed => "failed",
            State::Canceled => "canceled",
            State::Timeout => "timeout",
            State::Memory => "memory",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
