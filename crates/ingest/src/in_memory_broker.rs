//! In-memory broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use pullbridge_core::{QueueName, RawDelivery};

use crate::broker::{
    BrokerClient, BrokerError, DeliveryReceiver, LockToken, ReceiveMode, ReceivedMessage,
    ReceiverOptions,
};

/// In-memory queue broker.
///
/// - No IO
/// - Queues are created on first use
/// - Peek-lock with redelivery on abandon, or receive-and-delete
/// - Faults can be injected to exercise the processor's error path
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    namespace: String,
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    injected_faults: VecDeque<BrokerError>,
    next_lock: u64,
    closed: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<RawDelivery>,
    locked: HashMap<LockToken, RawDelivery>,
}

impl InMemoryBroker {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Shared {
                namespace: namespace.into(),
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a message (the producer side of the queue).
    pub fn send(&self, queue: &QueueName, delivery: RawDelivery) {
        self.state()
            .queues
            .entry(queue.as_str().to_string())
            .or_default()
            .ready
            .push_back(delivery);
        self.inner.notify.notify_waiters();
    }

    /// Make the next `receive` on any receiver fail with `fault`.
    pub fn inject_fault(&self, fault: BrokerError) {
        self.state().injected_faults.push_back(fault);
        self.inner.notify.notify_waiters();
    }

    /// Messages waiting to be handed out.
    pub fn ready_count(&self, queue: &QueueName) -> usize {
        self.state()
            .queues
            .get(queue.as_str())
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages handed out under a lock and not yet settled.
    pub fn locked_count(&self, queue: &QueueName) -> usize {
        self.state()
            .queues
            .get(queue.as_str())
            .map(|q| q.locked.len())
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    async fn create_receiver(
        &self,
        queue: &QueueName,
        options: &ReceiverOptions,
    ) -> Result<Arc<dyn DeliveryReceiver>, BrokerError> {
        let mut state = self.state();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state.queues.entry(queue.as_str().to_string()).or_default();
        drop(state);

        Ok(Arc::new(InMemoryReceiver {
            broker: self.clone(),
            queue: queue.as_str().to_string(),
            mode: options.receive_mode,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state().closed = true;
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

#[derive(Debug)]
struct InMemoryReceiver {
    broker: InMemoryBroker,
    queue: String,
    mode: ReceiveMode,
    closed: AtomicBool,
}

impl InMemoryReceiver {
    fn try_take(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let mut guard = self.broker.state();
        let state = &mut *guard;
        if state.closed || self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if let Some(fault) = state.injected_faults.pop_front() {
            return Err(fault);
        }

        let queue = state.queues.entry(self.queue.clone()).or_default();
        let take = max_messages.min(queue.ready.len());
        let mut out = Vec::with_capacity(take);

        for raw in queue.ready.drain(..take) {
            match self.mode {
                ReceiveMode::ReceiveAndDelete => out.push(ReceivedMessage {
                    raw,
                    lock_token: None,
                }),
                ReceiveMode::PeekLock => {
                    state.next_lock += 1;
                    let token = LockToken::new(format!("{}:{}", self.queue, state.next_lock));
                    queue.locked.insert(token.clone(), raw.clone());
                    out.push(ReceivedMessage {
                        raw,
                        lock_token: Some(token),
                    });
                }
            }
        }

        Ok(out)
    }
}

#[async_trait]
impl DeliveryReceiver for InMemoryReceiver {
    fn entity_path(&self) -> &str {
        &self.queue
    }

    fn receive_mode(&self) -> ReceiveMode {
        self.mode
    }

    async fn receive(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            // Register interest before checking so a concurrent send is not missed.
            let notified = self.broker.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.try_take(max_messages.max(1))?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn complete(&self, token: &LockToken) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::EntityNotFound(self.queue.clone()))?;
        queue
            .locked
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| BrokerError::LockLost(token.to_string()))
    }

    async fn abandon(&self, token: &LockToken) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::EntityNotFound(self.queue.clone()))?;
        let raw = queue
            .locked
            .remove(token)
            .ok_or_else(|| BrokerError::LockLost(token.to_string()))?;
        let redelivery = raw.clone().with_delivery_count(raw.delivery_count() + 1);
        queue.ready.push_front(redelivery);
        drop(state);

        self.broker.inner.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> QueueName {
        QueueName::new("orders").unwrap()
    }

    #[tokio::test]
    async fn receive_waits_then_returns_empty() {
        let broker = InMemoryBroker::new("local");
        let receiver = broker
            .create_receiver(&queue(), &ReceiverOptions::default())
            .await
            .unwrap();

        let got = receiver.receive(10, Duration::from_millis(20)).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn receive_wakes_on_send() {
        let broker = InMemoryBroker::new("local");
        let receiver = broker
            .create_receiver(&queue(), &ReceiverOptions::default())
            .await
            .unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.send(&queue(), RawDelivery::new("m-1", "late"));
        });

        let got = receiver.receive(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].raw.body(), b"late");
    }

    #[tokio::test]
    async fn peek_lock_holds_until_complete() {
        let broker = InMemoryBroker::new("local");
        broker.send(&queue(), RawDelivery::new("m-1", "a"));
        broker.send(&queue(), RawDelivery::new("m-2", "b"));
        let receiver = broker
            .create_receiver(&queue(), &ReceiverOptions::default())
            .await
            .unwrap();

        let got = receiver.receive(1, Duration::from_millis(20)).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(broker.ready_count(&queue()), 1);
        assert_eq!(broker.locked_count(&queue()), 1);

        let token = got[0].lock_token.clone().unwrap();
        receiver.complete(&token).await.unwrap();
        assert_eq!(broker.locked_count(&queue()), 0);
        assert_eq!(
            receiver.complete(&token).await,
            Err(BrokerError::LockLost(token.to_string()))
        );
    }

    #[tokio::test]
    async fn abandoned_delivery_comes_back_with_higher_count() {
        let broker = InMemoryBroker::new("local");
        broker.send(&queue(), RawDelivery::new("m-1", "a"));
        let receiver = broker
            .create_receiver(&queue(), &ReceiverOptions::default())
            .await
            .unwrap();

        let first = receiver.receive(1, Duration::from_millis(20)).await.unwrap();
        receiver
            .abandon(first[0].lock_token.as_ref().unwrap())
            .await
            .unwrap();

        let second = receiver.receive(1, Duration::from_millis(20)).await.unwrap();
        assert_eq!(second[0].raw.message_id(), "m-1");
        assert_eq!(second[0].raw.delivery_count(), 2);
    }

    #[tokio::test]
    async fn injected_fault_is_returned_once() {
        let broker = InMemoryBroker::new("local");
        let receiver = broker
            .create_receiver(&queue(), &ReceiverOptions::default())
            .await
            .unwrap();
        broker.inject_fault(BrokerError::Connection("reset by peer".into()));

        assert_eq!(
            receiver.receive(1, Duration::from_millis(20)).await,
            Err(BrokerError::Connection("reset by peer".into()))
        );
        assert!(receiver.receive(1, Duration::from_millis(20)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_client_refuses_new_receivers() {
        let broker = InMemoryBroker::new("local");
        broker.close().await.unwrap();

        let err = broker
            .create_receiver(&queue(), &ReceiverOptions::default())
            .await
            .err();
        assert_eq!(err, Some(BrokerError::Closed));
        assert!(broker.is_closed());
    }
}
