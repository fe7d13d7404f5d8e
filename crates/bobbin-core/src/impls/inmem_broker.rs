//! InMemoryBroker - 開発用・テスト用の配送チャネル
//!
//! # 学習ポイント
//! - `std::sync::Mutex` + `tokio::sync::Notify` による timeout 付き receive
//!   （ロックを保持したまま await しない）
//! - Drop による再配送: settle されずに捨てられた delivery はキューの先頭に戻る
//! - チャネル名ごとに独立したキュー

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::domain::{MessageId, TaskMessage};
use crate::error::BrokerError;
use crate::ports::{
    Broker, Delivery, DeliveryOutcome, IdGenerator, Outcome, Resident, SystemClock, TaskChannel,
    UlidGenerator,
};

#[derive(Default)]
struct ChannelState {
    ready: VecDeque<Resident>,
    in_flight: HashMap<MessageId, Resident>,
    settled: Vec<(MessageId, Outcome)>,
}

struct Shared {
    state: Mutex<ChannelState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One named channel.
pub struct InMemoryChannel {
    name: String,
    ids: Arc<dyn IdGenerator>,
    shared: Arc<Shared>,
}

impl InMemoryChannel {
    fn new(name: &str, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            name: name.to_string(),
            ids,
            shared: Arc::new(Shared {
                state: Mutex::new(ChannelState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Outcomes written so far, oldest first.
    pub fn settled(&self) -> Vec<(MessageId, Outcome)> {
        self.shared.lock().settled.clone()
    }

    /// Number of messages delivered but not yet settled.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    fn try_take(&self) -> Option<Delivery> {
        let mut state = self.shared.lock();
        let resident = state.ready.pop_front()?;
        state.in_flight.insert(resident.id, resident.clone());
        Some(Delivery {
            id: resident.id,
            message: resident.message,
            outcome: Box::new(InMemoryOutcome {
                shared: Arc::clone(&self.shared),
                resident: Some(resident),
            }),
        })
    }
}

#[async_trait]
impl TaskChannel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: TaskMessage, _no_reply: bool) -> Result<MessageId, BrokerError> {
        let id = self.ids.generate_message_id();
        self.shared.lock().ready.push_back(Resident { id, message });
        self.shared.notify.notify_one();
        Ok(id)
    }

    async fn receive(&self, timeout: Duration) -> Result<Delivery, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_take() {
                return Ok(delivery);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BrokerError::Empty {
                    queue: self.name.clone(),
                    timeout,
                });
            }
            // notify_one は permit を残すので、check と wait の間の send も取りこぼさない
            let _ = tokio::time::timeout(deadline - now, self.shared.notify.notified()).await;
        }
    }

    async fn resident(&self) -> Result<Vec<Resident>, BrokerError> {
        Ok(self.shared.lock().ready.iter().cloned().collect())
    }

    async fn settle(&self, id: MessageId, outcome: Outcome) -> Result<bool, BrokerError> {
        let mut state = self.shared.lock();
        let Some(pos) = state.ready.iter().position(|r| r.id == id) else {
            return Ok(false);
        };
        state.ready.remove(pos);
        state.settled.push((id, outcome));
        Ok(true)
    }
}

struct InMemoryOutcome {
    shared: Arc<Shared>,
    resident: Option<Resident>,
}

impl InMemoryOutcome {
    fn finish(&mut self, outcome: Outcome) {
        if let Some(resident) = self.resident.take() {
            let mut state = self.shared.lock();
            state.in_flight.remove(&resident.id);
            state.settled.push((resident.id, outcome));
        }
    }
}

#[async_trait]
impl DeliveryOutcome for InMemoryOutcome {
    async fn set_result(self: Box<Self>, value: serde_json::Value) -> Result<(), BrokerError> {
        let mut this = self;
        this.finish(Outcome::Result(value));
        Ok(())
    }

    async fn set_exception(self: Box<Self>, error: String) -> Result<(), BrokerError> {
        let mut this = self;
        this.finish(Outcome::Exception(error));
        Ok(())
    }
}

impl Drop for InMemoryOutcome {
    fn drop(&mut self) {
        // settle されないまま手放された: 先頭に戻して再配送
        if let Some(resident) = self.resident.take() {
            let mut state = self.shared.lock();
            state.in_flight.remove(&resident.id);
            state.ready.push_front(resident);
            drop(state);
            self.shared.notify.notify_one();
        }
    }
}

/// InMemoryBroker は名前ごとに `InMemoryChannel` を持つ
///
/// # 使用例
/// ```ignore
/// let broker = InMemoryBroker::new();
/// let channel = broker.channel("default");
/// channel.send(TaskMessage::new(task_id), true).await?;
/// let delivery = channel.receive(Duration::from_secs(1)).await?;
/// ```
pub struct InMemoryBroker {
    ids: Arc<dyn IdGenerator>,
    channels: Mutex<HashMap<String, Arc<InMemoryChannel>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(UlidGenerator::new(SystemClock)))
    }

    pub fn with_id_generator(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            ids,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Concrete channel handle (for inspecting settled outcomes in tests).
    pub fn channel(&self, name: &str) -> Arc<InMemoryChannel> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryChannel::new(name, Arc::clone(&self.ids))));
        Arc::clone(channel)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn task_queue(&self, name: &str) -> Result<Arc<dyn TaskChannel>, BrokerError> {
        Ok(self.channel(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use ulid::Ulid;

    fn message() -> TaskMessage {
        TaskMessage::new(TaskId::from_ulid(Ulid::new()))
    }

    #[tokio::test]
    async fn send_receive_roundtrip() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel("default");
        let msg = message();

        let id = channel.send(msg, true).await.unwrap();
        let delivery = channel.receive(Duration::from_secs(1)).await.unwrap();

        assert_eq!(delivery.id, id);
        assert_eq!(delivery.message, msg);
        assert_eq!(channel.in_flight(), 1);

        delivery.outcome.set_result(serde_json::json!(true)).await.unwrap();
        assert_eq!(channel.in_flight(), 0);
        assert_eq!(channel.settled(), vec![(id, Outcome::Result(serde_json::json!(true)))]);
    }

    #[tokio::test]
    async fn receive_times_out_with_empty() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel("default");
        let start = Instant::now();

        let err = channel.receive(Duration::from_millis(100)).await.unwrap_err();

        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(matches!(err, BrokerError::Empty { ref queue, .. } if queue == "default"));
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let broker = InMemoryBroker::new();
        let (m1, m2) = (message(), message());
        broker.channel("ns1").send(m1, true).await.unwrap();
        broker.channel("ns2").send(m2, true).await.unwrap();

        let d2 = broker.channel("ns2").receive(Duration::from_secs(1)).await.unwrap();
        let d1 = broker.channel("ns1").receive(Duration::from_secs(1)).await.unwrap();

        assert_eq!(d1.message, m1);
        assert_eq!(d2.message, m2);
    }

    #[tokio::test]
    async fn send_wakes_receiver() {
        let broker = Arc::new(InMemoryBroker::new());
        let msg = message();

        let waiter = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move {
                broker
                    .channel("default")
                    .receive(Duration::from_secs(5))
                    .await
                    .map(|d| d.message)
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        broker.channel("default").send(msg, true).await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), msg);
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered_first() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel("default");
        let (first, second) = (message(), message());
        channel.send(first, true).await.unwrap();
        channel.send(second, true).await.unwrap();

        let delivery = channel.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(delivery.message, first);
        drop(delivery);

        let again = channel.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.message, first);
        assert!(channel.settled().is_empty());
    }

    #[tokio::test]
    async fn settle_detaches_resident_message() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel("default");
        let id = channel.send(message(), true).await.unwrap();

        let outcome = Outcome::Result(serde_json::json!("cancelled"));
        assert!(channel.settle(id, outcome.clone()).await.unwrap());
        assert!(!channel.settle(id, outcome).await.unwrap());
        assert!(channel.resident().await.unwrap().is_empty());
    }
}
