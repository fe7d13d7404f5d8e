//! Queue - broker チャネルの上に乗る task の投入・取り出し・取り消し
//!
//! # 設計
//! - チャネルが運ぶのは `{"task_id": ...}` だけ。状態は store の task record が正本
//! - 1 つの task は同時に 1 つの queue にしか属さない（submit 時に他の queue から外す）
//! - remove / purge は「worker が拾う前の取り外し」で、best-effort

mod lease;

pub use lease::{LeaseOutcome, Settled, TaskLease};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{CANCELLED, State, TaskId, TaskMessage};
use crate::error::{QueueError, StoreError, TaskError};
use crate::observability::QueueStatus;
use crate::ports::{Outcome, TaskChannel};
use crate::session::Session;
use crate::task::Task;

/// A named queue bound to one broker channel.
#[derive(Clone)]
pub struct Queue {
    session: Session,
    name: String,
    channel: Arc<dyn TaskChannel>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &self.name).finish()
    }
}

impl Queue {
    pub fn new(session: Session, name: impl Into<String>, channel: Arc<dyn TaskChannel>) -> Self {
        Self {
            session,
            name: name.into(),
            channel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Put `task` on this queue.
    ///
    /// A task queued elsewhere is removed from that queue first. A task whose
    /// reference is already resident here is left untouched and `None` is
    /// returned. If the send fails the previous record is put back.
    pub async fn submit(&self, task: &mut Task) -> Result<Option<TaskId>, QueueError> {
        if let Some(other) = task.queue().filter(|q| *q != self.name).map(str::to_string) {
            let source = self.session.queue(&other).await?;
            source.remove([&mut *task]).await?;
        }

        if let Some(id) = task.id()
            && self.contains_id(id).await?
        {
            debug!(task_id = %id, queue = %self.name, "task already queued; skipping");
            return Ok(None);
        }

        // saved as QUEUED before the reference is visible to workers
        let previous = task.record().clone();
        task.transition(State::Queued)?;
        task.set_queue(Some(self.name.clone()));
        let id = match task.save().await {
            Ok(id) => id,
            Err(err) => {
                task.restore(previous);
                return Err(err.into());
            }
        };

        if let Err(err) = self.channel.send(TaskMessage::new(id), true).await {
            task.restore(previous);
            if let Err(undo) = task.save().await {
                warn!(task_id = %id, queue = %self.name, "could not restore task after failed send: {undo}");
            }
            return Err(err.into());
        }
        info!(task_id = %id, queue = %self.name, "task submitted");
        Ok(Some(id))
    }

    pub async fn submit_all<'a>(
        &self,
        tasks: impl IntoIterator<Item = &'a mut Task>,
    ) -> Result<Vec<Option<TaskId>>, QueueError> {
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(self.submit(task).await?);
        }
        Ok(ids)
    }

    /// Wait up to `timeout` for a task and lease it in `Processing`.
    ///
    /// References to missing tasks, or to tasks that cannot be processed, are
    /// settled with an exception and skipped.
    pub async fn next_task(&self, timeout: Duration) -> Result<TaskLease, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let delivery = self.channel.receive(remaining).await?;
            let task_id = delivery.message.task_id;

            let mut task = match Task::load(&self.session, task_id).await {
                Ok(task) => task,
                Err(TaskError::Store(StoreError::NotFound(_))) => {
                    warn!(task_id = %task_id, queue = %self.name, "skipping reference to missing task");
                    delivery
                        .outcome
                        .set_exception(format!("task {task_id} not found"))
                        .await?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            match task.set_state(State::Processing).await {
                Ok(()) => {}
                Err(TaskError::InvalidTransition { from, .. }) => {
                    warn!(task_id = %task_id, queue = %self.name, state = %from, "skipping task that cannot be processed");
                    delivery
                        .outcome
                        .set_exception(format!("task {task_id} is {from}"))
                        .await?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            debug!(task_id = %task_id, queue = %self.name, "task leased");
            return Ok(TaskLease::new(task, self.clone(), delivery.outcome));
        }
    }

    /// Detach the given tasks from this queue; they become `Canceled`.
    pub async fn remove<'a>(
        &self,
        tasks: impl IntoIterator<Item = &'a mut Task>,
    ) -> Result<Vec<TaskId>, QueueError> {
        let mut tasks: Vec<&mut Task> = tasks.into_iter().collect();
        let wanted: HashSet<TaskId> = tasks.iter().filter_map(|t| t.id()).collect();
        let detached = self.detach(|id| wanted.contains(&id)).await?;

        for task in tasks.iter_mut() {
            if let Some(id) = task.id()
                && detached.contains(&id)
            {
                self.mark_canceled(task).await?;
            }
        }
        Ok(detached)
    }

    /// Like `remove`, for tasks known only by id.
    pub async fn remove_ids(
        &self,
        ids: impl IntoIterator<Item = TaskId>,
    ) -> Result<Vec<TaskId>, QueueError> {
        let wanted: HashSet<TaskId> = ids.into_iter().collect();
        let detached = self.detach(|id| wanted.contains(&id)).await?;
        self.cancel_stored(&detached).await?;
        Ok(detached)
    }

    /// Detach every resident task. Returns how many were removed.
    pub async fn purge(&self) -> Result<usize, QueueError> {
        let detached = self.detach(|_| true).await?;
        self.cancel_stored(&detached).await?;
        info!(queue = %self.name, count = detached.len(), "queue purged");
        Ok(detached.len())
    }

    pub async fn contains(&self, task: &Task) -> Result<bool, QueueError> {
        match task.id() {
            Some(id) => self.contains_id(id).await,
            None => Ok(false),
        }
    }

    pub async fn contains_id(&self, id: TaskId) -> Result<bool, QueueError> {
        let resident = self.channel.resident().await?;
        Ok(resident.iter().any(|r| r.message.task_id == id))
    }

    /// Resident task ids in delivery order.
    pub async fn task_ids(&self) -> Result<Vec<TaskId>, QueueError> {
        let resident = self.channel.resident().await?;
        Ok(resident.into_iter().map(|r| r.message.task_id).collect())
    }

    /// Resident tasks in delivery order, loaded from the store.
    pub async fn tasks(&self) -> Result<Vec<Task>, QueueError> {
        let mut tasks = Vec::new();
        for id in self.task_ids().await? {
            if let Some(task) = self.load_resident(id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    pub async fn size(&self) -> Result<usize, QueueError> {
        Ok(self.channel.resident().await?.len())
    }

    /// Resident tasks counted by state.
    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let mut status = QueueStatus::new(&self.name);
        for task in self.tasks().await? {
            status.record(task.state());
        }
        Ok(status)
    }

    /// Settle every resident message whose task matches `filter` with the
    /// cancellation sentinel. Returns the detached task ids.
    async fn detach(&self, filter: impl Fn(TaskId) -> bool) -> Result<Vec<TaskId>, QueueError> {
        let mut detached = Vec::new();
        for resident in self.channel.resident().await? {
            let task_id = resident.message.task_id;
            if !filter(task_id) {
                continue;
            }
            let settled = self
                .channel
                .settle(resident.id, Outcome::Result(json!(CANCELLED)))
                .await?;
            // a worker may have received it since the snapshot
            if settled && !detached.contains(&task_id) {
                detached.push(task_id);
            }
        }
        Ok(detached)
    }

    async fn cancel_stored(&self, ids: &[TaskId]) -> Result<(), QueueError> {
        for &id in ids {
            if let Some(mut task) = self.load_resident(id).await? {
                self.mark_canceled(&mut task).await?;
            }
        }
        Ok(())
    }

    async fn mark_canceled(&self, task: &mut Task) -> Result<(), QueueError> {
        if let Err(err) = task.transition(State::Canceled) {
            warn!(task_id = ?task.id(), queue = %self.name, "detached without cancel: {err}");
        }
        task.set_queue(None);
        task.save().await?;
        debug!(task_id = ?task.id(), queue = %self.name, "task removed");
        Ok(())
    }

    async fn load_resident(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
        match Task::load(&self.session, id).await {
            Ok(task) => Ok(Some(task)),
            Err(TaskError::Store(StoreError::NotFound(_))) => {
                warn!(task_id = %id, queue = %self.name, "resident reference to missing task");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}
