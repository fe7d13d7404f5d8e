//! Worker loop - queue から lease を取り、実行して settle する
//!
//! - `run`: 1 本のループ。上限件数に達するか、queue が空になったら止まる
//! - `WorkerGroup`: 競合する複数ワーカー。空でも止まらず、shutdown 要求で止まる

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::queue::{LeaseOutcome, Queue};

/// Process tasks from `queue` until `max_tasks` have run or nothing arrives
/// within `timeout`. `None` (or zero) means no limit.
///
/// Task failures are recorded on the task and never end the loop; store or
/// broker failures do.
pub async fn run(
    queue: &Queue,
    max_tasks: Option<usize>,
    timeout: Duration,
) -> Result<usize, QueueError> {
    let limit = max_tasks.filter(|&n| n > 0);
    let mut processed = 0;

    while limit.is_none_or(|n| processed < n) {
        let lease = match queue.next_task(timeout).await {
            Ok(lease) => lease,
            Err(err) if err.is_empty() => {
                debug!(queue = %queue.name(), "queue drained");
                break;
            }
            Err(err) => return Err(err),
        };
        let settled = lease.run().await?;
        processed += 1;
        log_settled(queue.name(), &settled.outcome, settled.task.id());
    }

    info!(queue = %queue.name(), processed, "worker finished");
    Ok(processed)
}

fn log_settled(queue: &str, outcome: &LeaseOutcome, task_id: Option<crate::domain::TaskId>) {
    match outcome {
        LeaseOutcome::Done(_) => debug!(queue, task_id = ?task_id, "task done"),
        LeaseOutcome::Failed(error) => warn!(queue, task_id = ?task_id, "task failed: {error}"),
    }
}

/// Worker group handle.
/// - `request_shutdown()` で全ワーカーが新しい lease を取るのをやめる
/// - 実行中のタスクは中断しない
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<Result<usize, QueueError>>>,
}

impl WorkerGroup {
    /// Spawn `n` workers competing on `queue`.
    pub fn spawn(n: usize, queue: Queue, poll_timeout: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let q = queue.clone();
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, q, poll_timeout, &mut rx).await
            });
            joins.push(join);
        }

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown, wait for every worker and return the total processed.
    ///
    /// The first worker error is returned after all workers have stopped.
    pub async fn shutdown_and_join(self) -> Result<usize, QueueError> {
        self.request_shutdown();
        let mut total = 0;
        let mut first_err = None;
        for join in self.joins {
            match join.await {
                Ok(Ok(n)) => total += n,
                Ok(Err(err)) => {
                    first_err.get_or_insert(err);
                }
                Err(join_err) => warn!("worker task aborted: {join_err}"),
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(total),
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Queue,
    poll_timeout: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<usize, QueueError> {
    let mut processed = 0;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // next_task は待つので shutdown と競合させる
        let lease = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            lease = queue.next_task(poll_timeout) => lease,
        };

        let lease = match lease {
            Ok(lease) => lease,
            Err(err) if err.is_empty() => continue,
            Err(err) => {
                warn!(worker_id, queue = %queue.name(), "worker stopping: {err}");
                return Err(err);
            }
        };

        let settled = lease.run().await?;
        processed += 1;
        log_settled(queue.name(), &settled.outcome, settled.task.id());
    }
    debug!(worker_id, processed, "worker stopped");
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Module, ModuleRegistry};
    use crate::domain::State;
    use crate::session::Session;
    use serde_json::json;

    fn session() -> Session {
        let registry = ModuleRegistry::new();
        registry
            .register(Module::native("arith").function("add", |inv| {
                Ok(json!(inv.arg::<i64>(0)? + inv.arg::<i64>(1)?))
            }))
            .unwrap();
        Session::in_memory(registry)
    }

    async fn fill(session: &Session, queue: &Queue, n: usize) {
        for i in 0..n {
            let mut task = session
                .task("arith@add")
                .args([json!(i), json!(1)])
                .folder(std::env::temp_dir().display().to_string())
                .build()
                .await
                .unwrap();
            queue.submit(&mut task).await.unwrap();
        }
    }

    #[tokio::test]
    async fn run_stops_at_limit() {
        let session = session();
        let queue = session.queue("q").await.unwrap();
        fill(&session, &queue, 3).await;

        let processed = run(&queue, Some(2), Duration::from_millis(100)).await.unwrap();

        assert_eq!(processed, 2);
        assert_eq!(queue.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn run_stops_when_empty() {
        let session = session();
        let queue = session.queue("q").await.unwrap();
        fill(&session, &queue, 2).await;

        let processed = run(&queue, Some(0), Duration::from_millis(100)).await.unwrap();
        assert_eq!(processed, 2);

        let processed = run(&queue, None, Duration::from_millis(100)).await.unwrap();
        assert_eq!(processed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn group_drains_and_shuts_down() {
        let session = session();
        let queue = session.queue("q").await.unwrap();
        fill(&session, &queue, 6).await;
        let ids = queue.task_ids().await.unwrap();

        let group = WorkerGroup::spawn(3, queue.clone(), Duration::from_millis(20));
        for _ in 0..100 {
            if queue.size().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // let in-flight leases finish
        tokio::time::sleep(Duration::from_millis(100)).await;
        let total = group.shutdown_and_join().await.unwrap();

        assert_eq!(total, 6);
        for id in ids {
            assert_eq!(session.load_task(id).await.unwrap().state(), State::Done);
        }
    }
}
