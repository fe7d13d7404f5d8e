//! End-to-end queue scenarios against the in-memory store and broker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use ulid::Ulid;

use bobbin_core::command::Module;
use bobbin_core::config::Config;
use bobbin_core::domain::{CANCELLED, FileId, State, TaskId, TaskMessage};
use bobbin_core::error::{QueueError, StoreError, TaskError};
use bobbin_core::impls::{InMemoryBroker, InMemoryStore};
use bobbin_core::ports::{FileRef, ObjectStore, Outcome, TaskChannel};
use bobbin_core::queue::LeaseOutcome;
use bobbin_core::{CommandError, Session, Task, worker};

const POLL: Duration = Duration::from_millis(100);

struct Harness {
    session: Session,
    store: Arc<InMemoryStore>,
    broker: Arc<InMemoryBroker>,
    _dir: TempDir,
}

fn arith() -> Module {
    Module::native("arith")
        .function("add", |inv| {
            let (a, b) = (inv.arg::<i64>(0)?, inv.arg::<i64>(1)?);
            inv.println(format!("adding {a} and {b}"));
            Ok(json!(a + b))
        })
        .function("boom", |_| Err(CommandError::raised("boom")))
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let config = Config {
        work_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let session = Session::builder()
        .config(config)
        .store(store.clone())
        .broker(broker.clone())
        .module(arith())
        .unwrap()
        .expect_modules(&["arith"])
        .build()
        .unwrap();
    Harness {
        session,
        store,
        broker,
        _dir: dir,
    }
}

async fn add(session: &Session, a: i64, b: i64) -> Task {
    session
        .task("arith@add")
        .args([json!(a), json!(b)])
        .build()
        .await
        .unwrap()
}

fn outcomes(broker: &InMemoryBroker, queue: &str) -> Vec<Outcome> {
    broker
        .channel(queue)
        .settled()
        .into_iter()
        .map(|(_, outcome)| outcome)
        .collect()
}

#[tokio::test]
async fn success_walks_the_state_sequence() {
    let h = harness();
    let queue = h.session.queue("q").await.unwrap();
    let mut task = add(&h.session, 4, 5).await;
    assert_eq!(task.state(), State::Created);

    let id = queue.submit(&mut task).await.unwrap().unwrap();
    assert_eq!(task.state(), State::Queued);
    assert_eq!(h.session.load_task(id).await.unwrap().state(), State::Queued);

    let lease = queue.next_task(POLL).await.unwrap();
    assert_eq!(lease.task().state(), State::Processing);
    assert_eq!(h.session.load_task(id).await.unwrap().state(), State::Processing);

    let settled = lease.run().await.unwrap();
    assert_eq!(settled.outcome, LeaseOutcome::Done(json!(9)));

    let stored = h.session.load_task(id).await.unwrap();
    assert_eq!(stored.state(), State::Done);
    assert_eq!(stored.queue(), None);
    assert_eq!(stored.error(), None);
    assert_eq!(stored.stdout_text().await.unwrap(), "adding 4 and 5\n");
    assert_eq!(outcomes(&h.broker, "q"), vec![Outcome::Result(json!(9))]);
}

#[tokio::test]
async fn add_scenario_reports_results_in_order() {
    let h = harness();
    let queue = h.session.queue("q").await.unwrap();
    let mut first = add(&h.session, 4, 5).await;
    let mut second = add(&h.session, 24, 56).await;
    queue.submit_all([&mut first, &mut second]).await.unwrap();

    let processed = worker::run(&queue, None, POLL).await.unwrap();

    assert_eq!(processed, 2);
    assert_eq!(
        outcomes(&h.broker, "q"),
        vec![Outcome::Result(json!(9)), Outcome::Result(json!(80))]
    );
}

#[tokio::test]
async fn boom_scenario_captures_error_and_log() {
    let h = harness();
    let queue = h.session.queue("q").await.unwrap();
    let mut task = h.session.task("arith@boom").build().await.unwrap();
    let id = queue.submit(&mut task).await.unwrap().unwrap();

    let processed = worker::run(&queue, None, POLL).await.unwrap();
    assert_eq!(processed, 1);

    let stored = h.session.load_task(id).await.unwrap();
    assert_eq!(stored.state(), State::Failed);
    assert_eq!(stored.error(), Some("boom"));
    assert_eq!(stored.to_string(), "state=failed [boom]");
    assert!(stored.log_text().await.unwrap().contains("boom"));
    assert_eq!(outcomes(&h.broker, "q"), vec![Outcome::Exception("boom".into())]);
}

#[tokio::test]
async fn submit_twice_keeps_one_reference() {
    let h = harness();
    let queue = h.session.queue("q").await.unwrap();
    let mut task = add(&h.session, 1, 1).await;

    assert!(queue.submit(&mut task).await.unwrap().is_some());
    assert!(queue.submit(&mut task).await.unwrap().is_none());

    assert_eq!(queue.size().await.unwrap(), 1);
    assert_eq!(task.state(), State::Queued);
}

#[tokio::test]
async fn submit_elsewhere_moves_the_task() {
    let h = harness();
    let a = h.session.queue("a").await.unwrap();
    let b = h.session.queue("b").await.unwrap();
    let mut task = add(&h.session, 1, 1).await;

    a.submit(&mut task).await.unwrap();
    b.submit(&mut task).await.unwrap();

    assert_eq!(a.size().await.unwrap(), 0);
    assert!(b.contains(&task).await.unwrap());
    let stored = h.session.load_task(task.id().unwrap()).await.unwrap();
    assert_eq!(stored.queue(), Some("b"));
    assert_eq!(stored.state(), State::Queued);
    assert_eq!(
        outcomes(&h.broker, "a"),
        vec![Outcome::Result(json!(CANCELLED))]
    );
}

#[tokio::test]
async fn purge_cancels_all_resident_tasks() {
    let h = harness();
    let queue = h.session.queue("q").await.unwrap();
    let mut ids = Vec::new();
    for i in 0..5 {
        let mut task = add(&h.session, i, i).await;
        ids.push(queue.submit(&mut task).await.unwrap().unwrap());
    }

    assert_eq!(queue.purge().await.unwrap(), 5);

    assert_eq!(queue.size().await.unwrap(), 0);
    for id in ids {
        let stored = h.session.load_task(id).await.unwrap();
        assert_eq!(stored.state(), State::Canceled);
        assert_eq!(stored.queue(), None);
    }
    assert!(
        outcomes(&h.broker, "q")
            .iter()
            .all(|o| *o == Outcome::Result(json!(CANCELLED)))
    );
}

#[tokio::test]
async fn remove_detaches_given_tasks() {
    let h = harness();
    let queue = h.session.queue("q").await.unwrap();
    let mut keep = add(&h.session, 1, 2).await;
    let mut gone = add(&h.session, 3, 4).await;
    queue.submit_all([&mut keep, &mut gone]).await.unwrap();

    let removed = queue.remove([&mut gone]).await.unwrap();

    assert_eq!(removed, vec![gone.id().unwrap()]);
    assert_eq!(gone.state(), State::Canceled);
    assert_eq!(gone.queue(), None);
    assert_eq!(queue.task_ids().await.unwrap(), vec![keep.id().unwrap()]);
    let tasks = queue.tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state(), State::Queued);
}

#[tokio::test]
async fn resubmit_follows_queue_membership() {
    let h = harness();
    let queue = h.session.queue("q").await.unwrap();

    // never queued
    let mut fresh = add(&h.session, 1, 1).await;
    assert!(!fresh.resubmit(None).await.unwrap());
    assert_eq!(fresh.state(), State::Created);

    // still resident: nothing new is inserted
    queue.submit(&mut fresh).await.unwrap();
    assert!(!fresh.resubmit(None).await.unwrap());
    assert_eq!(queue.size().await.unwrap(), 1);
    queue.purge().await.unwrap();

    // failed task goes back on its own queue, then to another one
    let mut task = h.session.task("arith@boom").build().await.unwrap();
    let id = queue.submit(&mut task).await.unwrap().unwrap();
    worker::run(&queue, Some(1), POLL).await.unwrap();
    let mut failed = h.session.load_task(id).await.unwrap();
    assert_eq!(failed.state(), State::Failed);

    assert!(failed.resubmit(None).await.unwrap());
    assert_eq!(failed.state(), State::Queued);
    assert_eq!(failed.error(), None);
    assert!(queue.contains_id(id).await.unwrap());

    assert!(failed.resubmit(Some("priority")).await.unwrap());
    let priority = h.session.queue("priority").await.unwrap();
    assert!(!queue.contains_id(id).await.unwrap());
    assert!(priority.contains_id(id).await.unwrap());
    assert_eq!(failed.queue(), Some("priority"));
}

#[tokio::test]
async fn worker_honours_limit_and_empty_timeout() {
    let h = harness();
    let queue = h.session.queue("q").await.unwrap();
    for i in 0..3 {
        let mut task = add(&h.session, i, 1).await;
        queue.submit(&mut task).await.unwrap();
    }

    assert_eq!(worker::run(&queue, Some(2), POLL).await.unwrap(), 2);
    assert_eq!(queue.size().await.unwrap(), 1);

    let empty = h.session.queue("empty").await.unwrap();
    let started = std::time::Instant::now();
    assert_eq!(worker::run(&empty, None, Duration::from_millis(100)).await.unwrap(), 0);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn dropped_lease_is_redelivered() {
    let h = harness();
    let queue = h.session.queue("q").await.unwrap();
    let mut task = add(&h.session, 2, 3).await;
    let id = queue.submit(&mut task).await.unwrap().unwrap();

    let lease = queue.next_task(POLL).await.unwrap();
    assert_eq!(queue.size().await.unwrap(), 0);
    drop(lease);

    assert!(queue.contains_id(id).await.unwrap());
    let lease = queue.next_task(POLL).await.unwrap();
    assert_eq!(lease.task().id(), Some(id));
    let settled = lease.run().await.unwrap();
    assert_eq!(settled.outcome, LeaseOutcome::Done(json!(5)));
}

#[tokio::test]
async fn stale_references_are_skipped() {
    let h = harness();
    let queue = h.session.queue("q").await.unwrap();
    let channel = h.broker.channel("q");
    channel
        .send(TaskMessage::new(TaskId::from_ulid(Ulid::new())), true)
        .await
        .unwrap();

    // a finished task whose reference is still resident
    let mut done = add(&h.session, 1, 1).await;
    done.run().await.unwrap();
    channel
        .send(TaskMessage::new(done.id().unwrap()), true)
        .await
        .unwrap();

    let err = queue.next_task(POLL).await.unwrap_err();

    assert!(err.is_empty());
    let settled = outcomes(&h.broker, "q");
    assert_eq!(settled.len(), 2);
    assert!(settled.iter().all(|o| matches!(o, Outcome::Exception(_))));
}

#[tokio::test]
async fn store_outage_propagates_from_worker() {
    let h = harness();
    let queue = h.session.queue("q").await.unwrap();
    let mut task = add(&h.session, 1, 1).await;
    let id = queue.submit(&mut task).await.unwrap().unwrap();

    h.store.set_unavailable(true);
    let err = worker::run(&queue, None, POLL).await.unwrap_err();

    assert!(matches!(
        err,
        QueueError::Task(TaskError::Store(StoreError::Unavailable(_)))
    ));
    // the delivery went back to the channel
    assert!(queue.contains_id(id).await.unwrap());

    h.store.set_unavailable(false);
    assert_eq!(worker::run(&queue, None, POLL).await.unwrap(), 1);
    assert_eq!(h.session.load_task(id).await.unwrap().state(), State::Done);
}

#[tokio::test]
async fn failed_resubmit_restores_persisted_task() {
    let h = harness();
    let queue = h.session.queue("q").await.unwrap();
    let mut task = h.session.task("arith@boom").build().await.unwrap();
    let id = queue.submit(&mut task).await.unwrap().unwrap();
    worker::run(&queue, Some(1), POLL).await.unwrap();
    let mut failed = h.session.load_task(id).await.unwrap();

    h.store.set_unavailable(true);
    let err = failed.resubmit(None).await.unwrap_err();

    assert!(matches!(err, TaskError::Queue(_)));
    assert_eq!(failed.state(), State::Failed);
    assert_eq!(failed.error(), Some("boom"));
    assert_eq!(failed.queue(), Some("q"));
    assert!(!queue.contains_id(id).await.unwrap());

    h.store.set_unavailable(false);
    assert!(failed.resubmit(None).await.unwrap());
    assert_eq!(failed.state(), State::Queued);
}

/// Holds back every save of a QUEUED record.
struct SlowQueuedSaves {
    inner: InMemoryStore,
    delay: Duration,
}

#[async_trait::async_trait]
impl ObjectStore for SlowQueuedSaves {
    async fn save_task(
        &self,
        id: Option<TaskId>,
        record: serde_json::Value,
    ) -> Result<TaskId, StoreError> {
        if record["state"] == "queued" {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.save_task(id, record).await
    }

    async fn load_task(&self, id: TaskId) -> Result<serde_json::Value, StoreError> {
        self.inner.load_task(id).await
    }

    async fn create_file(&self, name: &str, encoding: Option<&str>) -> Result<FileRef, StoreError> {
        self.inner.create_file(name, encoding).await
    }

    async fn write_file(&self, id: FileId, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.inner.write_file(id, bytes).await
    }

    async fn append_file(&self, id: FileId, bytes: &[u8]) -> Result<(), StoreError> {
        self.inner.append_file(id, bytes).await
    }

    async fn read_file(&self, id: FileId) -> Result<Vec<u8>, StoreError> {
        self.inner.read_file(id).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiting_worker_picks_up_a_slowly_saved_submission() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        work_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let session = Session::builder()
        .config(config)
        .store(Arc::new(SlowQueuedSaves {
            inner: InMemoryStore::new(),
            delay: Duration::from_millis(50),
        }))
        .broker(Arc::new(InMemoryBroker::new()))
        .module(arith())
        .unwrap()
        .build()
        .unwrap();
    let queue = session.queue("q").await.unwrap();

    let waiting = queue.clone();
    let worker = tokio::spawn(async move {
        worker::run(&waiting, Some(1), Duration::from_millis(500)).await
    });
    // let the worker block in next_task first
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut task = add(&session, 4, 5).await;
    let id = queue.submit(&mut task).await.unwrap().unwrap();

    assert_eq!(worker.await.unwrap().unwrap(), 1);
    let stored = session.load_task(id).await.unwrap();
    assert_eq!(stored.state(), State::Done);
    assert_eq!(stored.queue(), None);
}
