//! Per-delivery context and acknowledgment handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio_util::sync::CancellationToken;

use pullbridge_core::RawDelivery;

use crate::broker::{BrokerError, DeliveryReceiver, LockToken};

/// Settlement state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleState {
    /// Locked, awaiting complete/abandon.
    Pending,
    /// A settlement call is in flight with the broker.
    Settling,
    Completed,
    Abandoned,
    /// Removed from the queue after exhausting its delivery attempts.
    Discarded,
    /// Received in receive-and-delete mode; nothing to settle.
    Deleted,
}

impl SettleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SettleState::Pending,
            1 => SettleState::Settling,
            2 => SettleState::Completed,
            3 => SettleState::Abandoned,
            4 => SettleState::Discarded,
            _ => SettleState::Deleted,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SettleState::Pending => 0,
            SettleState::Settling => 1,
            SettleState::Completed => 2,
            SettleState::Abandoned => 3,
            SettleState::Discarded => 4,
            SettleState::Deleted => 5,
        }
    }
}

/// Acknowledgment handle for one delivery.
///
/// Settling is at-most-once: the first successful `complete`/`abandon` wins
/// and later calls are no-ops. A settlement the broker rejects leaves the
/// handle `Pending` so it can still be abandoned. Clones share the same state.
#[derive(Clone)]
pub struct AckHandle {
    receiver: Arc<dyn DeliveryReceiver>,
    token: Option<LockToken>,
    state: Arc<AtomicU8>,
}

impl AckHandle {
    pub fn new(receiver: Arc<dyn DeliveryReceiver>, token: Option<LockToken>) -> Self {
        let initial = if token.is_some() {
            SettleState::Pending
        } else {
            SettleState::Deleted
        };
        Self {
            receiver,
            token,
            state: Arc::new(AtomicU8::new(initial.as_u8())),
        }
    }

    pub fn state(&self) -> SettleState {
        SettleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.state(), SettleState::Pending | SettleState::Settling)
    }

    pub fn lock_token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    /// Tell the broker the delivery was handled.
    pub async fn complete(&self) -> Result<(), BrokerError> {
        self.settle(SettleState::Completed).await
    }

    /// Release the delivery for redelivery.
    pub async fn abandon(&self) -> Result<(), BrokerError> {
        self.settle(SettleState::Abandoned).await
    }

    /// Remove a delivery that will not be retried again.
    pub async fn discard(&self) -> Result<(), BrokerError> {
        self.settle(SettleState::Discarded).await
    }

    async fn settle(&self, next: SettleState) -> Result<(), BrokerError> {
        let Some(token) = &self.token else {
            return Ok(());
        };
        if !self.claim() {
            return Ok(());
        }

        let result = match next {
            SettleState::Abandoned => self.receiver.abandon(token).await,
            _ => self.receiver.complete(token).await,
        };
        let settled = if result.is_ok() { next } else { SettleState::Pending };
        self.state.store(settled.as_u8(), Ordering::Release);
        result
    }

    fn claim(&self) -> bool {
        self.state
            .compare_exchange(
                SettleState::Pending.as_u8(),
                SettleState::Settling.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl core::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AckHandle")
            .field("entity_path", &self.receiver.entity_path())
            .field("token", &self.token)
            .field("state", &self.state())
            .finish()
    }
}

/// Everything a message handler gets for one delivery.
#[derive(Debug)]
pub struct DeliveryContext {
    delivery: RawDelivery,
    ack: AckHandle,
    cancel: CancellationToken,
}

impl DeliveryContext {
    pub fn new(delivery: RawDelivery, ack: AckHandle, cancel: CancellationToken) -> Self {
        Self {
            delivery,
            ack,
            cancel,
        }
    }

    pub fn delivery(&self) -> &RawDelivery {
        &self.delivery
    }

    pub fn ack_handle(&self) -> &AckHandle {
        &self.ack
    }

    pub async fn complete(&self) -> Result<(), BrokerError> {
        self.ack.complete().await
    }

    pub async fn abandon(&self) -> Result<(), BrokerError> {
        self.ack.abandon().await
    }

    /// Cancelled when the processor is stopping.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}
