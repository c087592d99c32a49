//! Delivery processor: push-style concurrent dispatch over a pull receiver.
//!
//! A [`Processor`] is bound to one queue. Once started it runs a pump task
//! that pulls up to `prefetch_count` deliveries at a time and hands each to
//! the registered [`MessageHandler`] on its own task, with at most
//! `max_concurrent_deliveries` handlers in flight. Faults are routed to the
//! registered [`ErrorHandler`] and drive the [`SessionState`] machine:
//!
//! - transient receive faults are retried per the [`RetryPolicy`]
//! - terminal faults, or exhausted retries, move the session to `faulted`
//! - a delivery that keeps failing is abandoned until it has been delivered
//!   `max_delivery_count` times, then discarded
//!
//! `stop()` cancels the pump, waits for in-flight handlers, and closes the
//! receiver.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pullbridge_core::{ConfigError, ProcessorId, QueueName, ReceiverId};

use crate::broker::{
    BrokerClient, BrokerError, DeliveryReceiver, ReceiveMode, ReceivedMessage, ReceiverOptions,
};
use crate::delivery::{AckHandle, DeliveryContext, SettleState};
use crate::handler::{DeliveryFault, ErrorEvent, ErrorHandler, ErrorSource, MessageHandler};
use crate::retry::RetryPolicy;
use crate::session::{SessionHealth, SessionState, SessionTracker};

/// Processor tuning options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Complete deliveries the handler returned `Ok` for but left unsettled.
    pub auto_complete: bool,
    /// Upper bound on simultaneous in-flight handler executions.
    pub max_concurrent_deliveries: usize,
    /// Deliveries the broker may hand out ahead of acknowledgment.
    pub prefetch_count: u32,
    pub receive_mode: ReceiveMode,
    /// How long one receive call waits for traffic before looping.
    pub max_wait_time: Duration,
    /// Bound on `start()` confirming the subscription with the broker.
    pub start_timeout: Duration,
    /// Attempts a failing delivery gets before it is discarded.
    pub max_delivery_count: u32,
    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            auto_complete: false,
            max_concurrent_deliveries: 10,
            prefetch_count: 100,
            receive_mode: ReceiveMode::PeekLock,
            max_wait_time: Duration::from_secs(1),
            start_timeout: Duration::from_secs(30),
            max_delivery_count: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_deliveries == 0 {
            return Err(ConfigError::invalid_value(
                "max_concurrent_deliveries",
                "must be at least 1",
            ));
        }
        if self.max_concurrent_deliveries > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid_value(
                "max_concurrent_deliveries",
                format!("must be at most {}", Semaphore::MAX_PERMITS),
            ));
        }
        if self.max_wait_time.is_zero() {
            return Err(ConfigError::invalid_value("max_wait_time", "must be non-zero"));
        }
        if self.start_timeout.is_zero() {
            return Err(ConfigError::invalid_value("start_timeout", "must be non-zero"));
        }
        if self.max_delivery_count == 0 {
            return Err(ConfigError::invalid_value("max_delivery_count", "must be at least 1"));
        }
        Ok(())
    }

    /// Deliveries requested per receive call.
    fn batch_size(&self) -> usize {
        self.prefetch_count.max(1) as usize
    }
}

/// Lifecycle misuse and start-up failures.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("processor is {actual}, expected {expected}")]
    InvalidState {
        actual: SessionState,
        expected: SessionState,
    },

    #[error("no {0} handler registered")]
    HandlerNotRegistered(&'static str),

    #[error("subscription did not become active within {0:?}")]
    StartTimeout(Duration),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct Running {
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    receiver: Arc<dyn DeliveryReceiver>,
    dispatch: Arc<Dispatch>,
}

/// Subscription to one queue with concurrent handler dispatch.
pub struct Processor {
    id: ProcessorId,
    client: Arc<dyn BrokerClient>,
    queue: QueueName,
    config: ProcessorConfig,
    message_handler: Option<Arc<dyn MessageHandler>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    session: Arc<SessionTracker>,
    running: Mutex<Option<Running>>,
}

impl Processor {
    /// Bind a processor to `queue_name` on an existing client.
    pub fn new(
        client: Arc<dyn BrokerClient>,
        queue_name: &str,
        config: ProcessorConfig,
    ) -> Result<Self, ConfigError> {
        let queue = QueueName::new(queue_name)?;
        config.validate()?;

        let id = ProcessorId::new();
        Ok(Self {
            id,
            client,
            session: Arc::new(SessionTracker::new(id, queue.clone())),
            queue,
            config,
            message_handler: None,
            error_handler: None,
            running: Mutex::new(None),
        })
    }

    /// Register the delivery handler. Must happen before `start()`.
    pub fn on_message<H>(&mut self, handler: H)
    where
        H: MessageHandler,
    {
        self.message_handler = Some(Arc::new(handler));
    }

    /// Register the error handler. Must happen before `start()`.
    pub fn on_error<H>(&mut self, handler: H)
    where
        H: ErrorHandler,
    {
        self.error_handler = Some(Arc::new(handler));
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn BrokerClient> {
        &self.client
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Watch state transitions (e.g. to await `faulted`).
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    pub fn health(&self) -> SessionHealth {
        self.session.health()
    }

    /// Open the subscription and begin dispatching deliveries.
    ///
    /// Completes once the broker confirms the receiver, bounded by
    /// `start_timeout`. A failed start leaves the session `faulted`.
    pub async fn start(&self) -> Result<(), ProcessorError> {
        let mut running = self.running.lock().await;

        let actual = self.session.state();
        if actual != SessionState::Initialized {
            return Err(ProcessorError::InvalidState {
                actual,
                expected: SessionState::Initialized,
            });
        }

        let message_handler = self
            .message_handler
            .clone()
            .ok_or(ProcessorError::HandlerNotRegistered("message"))?;
        let error_handler = self
            .error_handler
            .clone()
            .ok_or(ProcessorError::HandlerNotRegistered("error"))?;

        let options = ReceiverOptions {
            receiver_id: ReceiverId::new(),
            receive_mode: self.config.receive_mode,
            prefetch_count: self.config.prefetch_count,
        };

        let opened = tokio::time::timeout(
            self.config.start_timeout,
            self.client.create_receiver(&self.queue, &options),
        )
        .await;

        let receiver = match opened {
            Ok(Ok(receiver)) => receiver,
            Ok(Err(e)) => {
                let shared = Dispatch {
                    namespace: self.client.namespace().to_string(),
                    entity_path: self.queue.to_string(),
                    error_handler,
                    session: self.session.clone(),
                };
                shared.report(ErrorSource::Receive, e.clone().into()).await;
                self.session.transition(SessionState::Faulted);
                return Err(ProcessorError::Broker(e));
            }
            Err(_) => {
                let timeout = self.config.start_timeout;
                error!(
                    processor_id = %self.id,
                    queue = %self.queue,
                    timeout_ms = timeout.as_millis() as u64,
                    "subscription start timed out"
                );
                self.session.record_lifecycle_fault(
                    ErrorSource::Receive,
                    format!("subscription did not become active within {timeout:?}"),
                );
                self.session.transition(SessionState::Faulted);
                return Err(ProcessorError::StartTimeout(timeout));
            }
        };

        let cancel = CancellationToken::new();
        let dispatch = Arc::new(Dispatch {
            namespace: self.client.namespace().to_string(),
            entity_path: receiver.entity_path().to_string(),
            error_handler,
            session: self.session.clone(),
        });
        let pump = Pump {
            processor_id: self.id,
            receiver: receiver.clone(),
            config: self.config.clone(),
            cancel: cancel.clone(),
            message_handler,
            dispatch: dispatch.clone(),
        };

        self.session.transition(SessionState::Processing);
        let pump = tokio::spawn(pump.run());

        info!(
            processor_id = %self.id,
            namespace = %self.client.namespace(),
            queue = %self.queue,
            receive_mode = %self.config.receive_mode,
            max_concurrent_deliveries = self.config.max_concurrent_deliveries,
            prefetch_count = self.config.prefetch_count,
            "processor started"
        );

        *running = Some(Running {
            cancel,
            pump,
            receiver,
            dispatch,
        });
        Ok(())
    }

    /// Stop accepting deliveries, drain in-flight handlers, close the receiver.
    ///
    /// Idempotent.
    pub async fn stop(&self) -> Result<(), ProcessorError> {
        let mut running = self.running.lock().await;

        if let Some(r) = running.take() {
            r.cancel.cancel();
            if let Err(e) = r.pump.await {
                error!(processor_id = %self.id, error = %e, "processor pump task failed");
            }
            if let Err(e) = r.receiver.close().await {
                r.dispatch.report(ErrorSource::Close, e.into()).await;
            }
        }

        self.session.transition(SessionState::Stopped);
        info!(processor_id = %self.id, queue = %self.queue, "processor stopped");
        Ok(())
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        if let Some(r) = self.running.get_mut().take() {
            r.cancel.cancel();
            warn!(processor_id = %self.id, queue = %self.queue, "processor dropped without stop");
        }
    }
}

impl core::fmt::Debug for Processor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("namespace", &self.client.namespace())
            .field("queue", &self.queue)
            .field("state", &self.session.state())
            .finish()
    }
}

/// State shared by the pump and every delivery task.
struct Dispatch {
    namespace: String,
    entity_path: String,
    error_handler: Arc<dyn ErrorHandler>,
    session: Arc<SessionTracker>,
}

impl Dispatch {
    async fn report(&self, source: ErrorSource, fault: DeliveryFault) {
        let event = ErrorEvent {
            source,
            namespace: self.namespace.clone(),
            entity_path: self.entity_path.clone(),
            fault,
        };
        self.session.record_fault(&event);
        self.error_handler.handle(&event).await;
    }
}

struct Pump {
    processor_id: ProcessorId,
    receiver: Arc<dyn DeliveryReceiver>,
    config: ProcessorConfig,
    cancel: CancellationToken,
    message_handler: Arc<dyn MessageHandler>,
    dispatch: Arc<Dispatch>,
}

impl Pump {
    async fn run(self) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_deliveries));
        let mut in_flight = JoinSet::new();
        let mut attempt: u32 = 0;

        debug!(processor_id = %self.processor_id, "processor pump running");

        loop {
            while let Some(finished) = in_flight.try_join_next() {
                if let Err(e) = finished {
                    error!(processor_id = %self.processor_id, error = %e, "delivery task failed");
                }
            }

            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.receiver.receive(self.config.batch_size(), self.config.max_wait_time) => r,
            };

            match received {
                Ok(batch) => {
                    attempt = 0;
                    let mut batch = batch.into_iter();
                    while let Some(message) = batch.next() {
                        let permit = tokio::select! {
                            _ = self.cancel.cancelled() => None,
                            p = permits.clone().acquire_owned() => p.ok(),
                        };
                        match permit {
                            Some(permit) => {
                                in_flight.spawn(deliver(
                                    self.dispatch.clone(),
                                    self.message_handler.clone(),
                                    self.receiver.clone(),
                                    message,
                                    self.config.auto_complete,
                                    self.config.max_delivery_count,
                                    self.cancel.child_token(),
                                    permit,
                                ));
                            }
                            None => {
                                self.release(std::iter::once(message).chain(batch.by_ref()))
                                    .await;
                                break;
                            }
                        }
                    }
                }
                Err(fault) => {
                    let transient = fault.is_transient();
                    self.dispatch
                        .report(ErrorSource::Receive, fault.clone().into())
                        .await;

                    if transient && self.config.retry.should_retry(attempt) {
                        attempt += 1;
                        let delay = self.config.retry.delay_for_attempt(attempt);
                        warn!(
                            processor_id = %self.processor_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %fault,
                            "transient receive fault, retrying"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }

                    error!(
                        processor_id = %self.processor_id,
                        transient,
                        attempts = attempt,
                        error = %fault,
                        "receive loop giving up"
                    );
                    self.dispatch.session.transition(SessionState::Faulted);
                    break;
                }
            }
        }

        while let Some(finished) = in_flight.join_next().await {
            if let Err(e) = finished {
                error!(processor_id = %self.processor_id, error = %e, "delivery task failed");
            }
        }
        debug!(processor_id = %self.processor_id, "processor pump drained");
    }

    /// Hand back deliveries received but never dispatched.
    async fn release(&self, messages: impl Iterator<Item = ReceivedMessage>) {
        for message in messages {
            let ack = AckHandle::new(self.receiver.clone(), message.lock_token);
            if let Err(e) = ack.abandon().await {
                self.dispatch.report(ErrorSource::Abandon, e.into()).await;
            }
        }
    }
}

async fn deliver(
    dispatch: Arc<Dispatch>,
    handler: Arc<dyn MessageHandler>,
    receiver: Arc<dyn DeliveryReceiver>,
    message: ReceivedMessage,
    auto_complete: bool,
    max_delivery_count: u32,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    dispatch.session.record_received();

    let message_id = message.raw.message_id().to_string();
    let delivery_count = message.raw.delivery_count();
    let ack = AckHandle::new(receiver, message.lock_token);
    let ctx = DeliveryContext::new(message.raw, ack.clone(), cancel);

    // A separate task so a panicking handler surfaces as a JoinError here.
    let outcome = tokio::spawn(async move { handler.handle(&ctx).await }).await;

    let fault = match outcome {
        Ok(Ok(())) => {
            if auto_complete && !ack.is_settled() {
                if let Err(e) = ack.complete().await {
                    dispatch.report(ErrorSource::Complete, e.into()).await;
                }
            }
            None
        }
        Ok(Err(e)) => Some(DeliveryFault::Handler(e)),
        Err(join) => Some(DeliveryFault::Panicked(join.to_string())),
    };

    if let Some(fault) = fault {
        dispatch
            .report(ErrorSource::ProcessMessageCallback, fault)
            .await;

        if delivery_count >= max_delivery_count && !ack.is_settled() {
            match ack.discard().await {
                Ok(()) => {
                    warn!(
                        message_id = %message_id,
                        delivery_count,
                        max_delivery_count,
                        "delivery attempts exhausted, discarding"
                    );
                    let fault = DeliveryFault::DeliveryLimitExceeded {
                        message_id,
                        delivery_count,
                    };
                    dispatch.report(ErrorSource::Discard, fault).await;
                }
                Err(e) => dispatch.report(ErrorSource::Discard, e.into()).await,
            }
        } else if let Err(e) = ack.abandon().await {
            dispatch.report(ErrorSource::Abandon, e.into()).await;
        }
    }

    match ack.state() {
        SettleState::Completed | SettleState::Deleted => dispatch.session.record_completed(),
        SettleState::Abandoned => dispatch.session.record_abandoned(),
        SettleState::Discarded => dispatch.session.record_discarded(),
        SettleState::Pending | SettleState::Settling => {}
    }
}
