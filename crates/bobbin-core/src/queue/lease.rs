//! TaskLease - worker が 1 件の配送を所有している間のハンドル
//!
//! `complete` / `fail` / `run` のどれかで必ず settle する。settle せずに drop した
//! lease は警告を出し、配送は broker に戻されて再配送される。

use serde_json::Value;
use tracing::{debug, warn};

use super::Queue;
use crate::domain::{State, TaskId};
use crate::error::QueueError;
use crate::ports::DeliveryOutcome;
use crate::task::Task;

struct OutcomeGuard {
    task_id: Option<TaskId>,
    queue: String,
    outcome: Option<Box<dyn DeliveryOutcome>>,
}

impl OutcomeGuard {
    fn take(&mut self) -> Option<Box<dyn DeliveryOutcome>> {
        self.outcome.take()
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        if self.outcome.is_some() {
            warn!(
                task_id = ?self.task_id,
                queue = %self.queue,
                "lease dropped without settling; delivery released for redelivery"
            );
        }
    }
}

/// How a leased task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    Done(Value),
    Failed(String),
}

/// Result of `TaskLease::run`.
#[derive(Debug)]
pub struct Settled {
    pub task: Task,
    pub outcome: LeaseOutcome,
}

/// A task received from a queue, in `Processing`, owned by one worker.
pub struct TaskLease {
    task: Task,
    queue: Queue,
    guard: OutcomeGuard,
}

impl std::fmt::Debug for TaskLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLease")
            .field("task", &self.task.id())
            .field("queue", &self.queue.name())
            .field("settled", &self.guard.outcome.is_none())
            .finish()
    }
}

impl TaskLease {
    pub(crate) fn new(task: Task, queue: Queue, outcome: Box<dyn DeliveryOutcome>) -> Self {
        let guard = OutcomeGuard {
            task_id: task.id(),
            queue: queue.name().to_string(),
            outcome: Some(outcome),
        };
        Self { task, queue, guard }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn task_mut(&mut self) -> &mut Task {
        &mut self.task
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Report success. A task still `Running` is forced to `Done`; the task
    /// leaves the queue and is saved before the delivery is acknowledged.
    pub async fn complete(self, result: Value) -> Result<Task, QueueError> {
        let TaskLease {
            mut task,
            mut guard,
            ..
        } = self;
        if task.state() == State::Running {
            task.transition(State::Done)?;
        }
        task.set_queue(None);
        task.save().await?;
        if let Some(outcome) = guard.take() {
            outcome.set_result(result).await?;
        }
        debug!(task_id = ?task.id(), "lease completed");
        Ok(task)
    }

    /// Report failure to whoever awaits the delivery. The task keeps its
    /// queue so it can be resubmitted.
    pub async fn fail(self, error: &str) -> Result<Task, QueueError> {
        let TaskLease {
            task, mut guard, ..
        } = self;
        if let Some(outcome) = guard.take() {
            outcome.set_exception(error.to_string()).await?;
        }
        debug!(task_id = ?task.id(), "lease failed");
        Ok(task)
    }

    /// Run the task and settle the delivery.
    ///
    /// Execution errors are contained as `LeaseOutcome::Failed`. Store and
    /// broker failures settle with an exception and propagate.
    pub async fn run(mut self) -> Result<Settled, QueueError> {
        match self.task.run().await {
            Ok(value) => {
                let task = self.complete(value.clone()).await?;
                Ok(Settled {
                    task,
                    outcome: LeaseOutcome::Done(value),
                })
            }
            Err(err) if err.is_execution() => {
                let message = err.to_string();
                let task = self.fail(&message).await?;
                Ok(Settled {
                    task,
                    outcome: LeaseOutcome::Failed(message),
                })
            }
            Err(err) => {
                if let Some(outcome) = self.guard.take()
                    && let Err(settle_err) = outcome.set_exception(err.to_string()).await
                {
                    warn!(task_id = ?self.task.id(), "could not settle delivery: {settle_err}");
                }
                Err(err.into())
            }
        }
    }
}
