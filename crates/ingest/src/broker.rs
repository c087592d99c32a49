//! Broker capability abstraction (mechanics only).
//!
//! The bridge depends on a small capability set rather than on a wire
//! protocol:
//!
//! - **connect**: constructing a [`BrokerClient`]
//! - **create-subscription**: [`BrokerClient::create_receiver`]
//! - **receive**: [`DeliveryReceiver::receive`], a bounded pull of prefetched deliveries
//! - **acknowledge**: [`DeliveryReceiver::complete`] / [`DeliveryReceiver::abandon`]
//!
//! Push-style dispatch (handler callbacks, concurrency bound) is layered on
//! top of this by [`crate::Processor`].
//!
//! ## Delivery Guarantees
//!
//! In [`ReceiveMode::PeekLock`] a delivery stays locked until completed or
//! abandoned; an abandoned delivery is handed out again with a higher
//! delivery count (at-least-once). In [`ReceiveMode::ReceiveAndDelete`] the
//! broker removes the message as it hands it out (at-most-once) and no lock
//! token is issued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pullbridge_core::{ConfigError, QueueName, RawDelivery, ReceiverId};

/// Whether deliveries must be settled explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveMode {
    /// Delivery is locked; the consumer completes or abandons it.
    #[default]
    PeekLock,
    /// Delivery is removed from the queue as soon as it is received.
    ReceiveAndDelete,
}

impl ReceiveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiveMode::PeekLock => "peek_lock",
            ReceiveMode::ReceiveAndDelete => "receive_and_delete",
        }
    }
}

impl core::fmt::Display for ReceiveMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ReceiveMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "peeklock" => Ok(ReceiveMode::PeekLock),
            "receiveanddelete" => Ok(ReceiveMode::ReceiveAndDelete),
            _ => Err(ConfigError::invalid_value(
                "receive_mode",
                format!("'{s}' (expected peek_lock or receive_and_delete)"),
            )),
        }
    }
}

/// Opaque token identifying a locked delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LockToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivery pulled from a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub raw: RawDelivery,
    /// `None` in receive-and-delete mode.
    pub lock_token: Option<LockToken>,
}

/// Options for a receiver bound to one queue.
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    pub receiver_id: ReceiverId,
    pub receive_mode: ReceiveMode,
    pub prefetch_count: u32,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            receiver_id: ReceiverId::new(),
            receive_mode: ReceiveMode::default(),
            prefetch_count: 0,
        }
    }
}

/// Broker-reported fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker operation timed out: {0}")]
    Timeout(String),

    #[error("message lock lost: {0}")]
    LockLost(String),

    #[error("messaging entity not found: {0}")]
    EntityNotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("receiver or client is closed")]
    Closed,
}

impl BrokerError {
    /// Transient faults may succeed on retry; everything else ends the session.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_)
                | BrokerError::Timeout(_)
                | BrokerError::LockLost(_)
                | BrokerError::Command(_)
        )
    }
}

/// Connection to a broker namespace.
///
/// One instance per bridge; shared by reference (`Arc`) between the processor
/// and whoever owns shutdown.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Fully qualified namespace (endpoint host) this client is connected to.
    fn namespace(&self) -> &str;

    /// Open a receiver on `queue`. Completes once the subscription is active.
    async fn create_receiver(
        &self,
        queue: &QueueName,
        options: &ReceiverOptions,
    ) -> Result<Arc<dyn DeliveryReceiver>, BrokerError>;

    /// Release the connection. Receivers created afterwards fail with [`BrokerError::Closed`].
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Pull side of a subscription.
#[async_trait]
pub trait DeliveryReceiver: Send + Sync + 'static {
    /// Entity (queue) path this receiver reads from.
    fn entity_path(&self) -> &str;

    fn receive_mode(&self) -> ReceiveMode;

    /// Wait up to `max_wait` for at least one delivery; return at most `max_messages`.
    ///
    /// An empty vector means the wait elapsed without traffic.
    async fn receive(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BrokerError>;

    /// Acknowledge a locked delivery; the broker removes it from the queue.
    async fn complete(&self, token: &LockToken) -> Result<(), BrokerError>;

    /// Release a locked delivery for redelivery.
    async fn abandon(&self, token: &LockToken) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> BrokerClient for Arc<B>
where
    B: BrokerClient + ?Sized,
{
    fn namespace(&self) -> &str {
        (**self).namespace()
    }

    async fn create_receiver(
        &self,
        queue: &QueueName,
        options: &ReceiverOptions,
    ) -> Result<Arc<dyn DeliveryReceiver>, BrokerError> {
        (**self).create_receiver(queue, options).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        (**self).close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_mode_parses_common_spellings() {
        assert_eq!("peek_lock".parse::<ReceiveMode>().unwrap(), ReceiveMode::PeekLock);
        assert_eq!("PeekLock".parse::<ReceiveMode>().unwrap(), ReceiveMode::PeekLock);
        assert_eq!(
            "receive-and-delete".parse::<ReceiveMode>().unwrap(),
            ReceiveMode::ReceiveAndDelete
        );
        assert!("sometimes".parse::<ReceiveMode>().is_err());
    }

    #[test]
    fn only_connection_level_faults_are_transient() {
        assert!(BrokerError::Connection("reset".into()).is_transient());
        assert!(BrokerError::Timeout("read".into()).is_transient());
        assert!(BrokerError::LockLost("m-1".into()).is_transient());
        assert!(!BrokerError::EntityNotFound("q".into()).is_transient());
        assert!(!BrokerError::Unauthorized("key".into()).is_transient());
        assert!(!BrokerError::Closed.is_transient());
    }
}
