//! Delivery and error handler contracts.

use async_trait::async_trait;
use serde::Serialize;

use pullbridge_core::NormalizationError;

use crate::broker::BrokerError;
use crate::delivery::DeliveryContext;

/// Invoked once per delivery, possibly from many tasks at once.
///
/// Returning `Err` (or panicking) never reaches the broker's dispatch loop:
/// the processor reports the failure to the [`ErrorHandler`] and abandons the
/// delivery if the handler left it unsettled.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &DeliveryContext) -> Result<(), HandlerError>;
}

/// Invoked for every delivery-layer fault. Observes only; must not fail.
#[async_trait]
pub trait ErrorHandler: Send + Sync + 'static {
    async fn handle(&self, event: &ErrorEvent);
}

/// Failure inside a message handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("normalization failed: {0}")]
    Normalization(#[from] NormalizationError),

    #[error("settlement failed: {0}")]
    Settlement(#[from] BrokerError),

    #[error("{0}")]
    Failed(String),
}

/// Where in the delivery pipeline a fault happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// Opening the receiver or pulling deliveries.
    Receive,
    Complete,
    Abandon,
    /// The message handler returned an error or panicked.
    ProcessMessageCallback,
    /// A delivery ran out of attempts and was removed from the queue.
    Discard,
    Close,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSource::Receive => "receive",
            ErrorSource::Complete => "complete",
            ErrorSource::Abandon => "abandon",
            ErrorSource::ProcessMessageCallback => "process_message_callback",
            ErrorSource::Discard => "discard",
            ErrorSource::Close => "close",
        }
    }
}

impl core::fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fault carried by an [`ErrorEvent`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFault {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("message handler panicked: {0}")]
    Panicked(String),

    #[error("delivery {message_id} failed {delivery_count} times and was discarded")]
    DeliveryLimitExceeded {
        message_id: String,
        delivery_count: u32,
    },
}

impl DeliveryFault {
    pub fn is_transient(&self) -> bool {
        match self {
            DeliveryFault::Broker(e) => e.is_transient(),
            DeliveryFault::Handler(HandlerError::Settlement(e)) => e.is_transient(),
            _ => false,
        }
    }
}

/// Arguments of the error callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub source: ErrorSource,
    /// Broker namespace (endpoint host).
    pub namespace: String,
    /// Queue path the fault relates to.
    pub entity_path: String,
    pub fault: DeliveryFault,
}
