//! Handlers wiring the processor to the ingestion buffer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use pullbridge_core::normalize;

use crate::buffer::IngestionBuffer;
use crate::delivery::DeliveryContext;
use crate::handler::{ErrorEvent, ErrorHandler, HandlerError, MessageHandler};

/// Normalizes each delivery, appends it to the buffer, then acknowledges it.
///
/// A delivery that fails normalization is neither buffered nor acknowledged.
#[derive(Debug, Clone)]
pub struct IngestionHandler {
    buffer: Arc<IngestionBuffer>,
}

impl IngestionHandler {
    pub fn new(buffer: Arc<IngestionBuffer>) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &Arc<IngestionBuffer> {
        &self.buffer
    }
}

#[async_trait]
impl MessageHandler for IngestionHandler {
    async fn handle(&self, ctx: &DeliveryContext) -> Result<(), HandlerError> {
        let raw = ctx.delivery();
        let record = normalize(raw)?;

        info!(
            message_id = %raw.message_id(),
            body_len = record.body().len(),
            session_id = record.session_id().unwrap_or("-"),
            scheduled_enqueue_time_utc = ?record.scheduled_enqueue_time_utc(),
            delivery_count = raw.delivery_count(),
            "message received"
        );

        let sequence = self.buffer.insert(record);
        ctx.complete().await?;

        debug!(message_id = %raw.message_id(), sequence, "message buffered and completed");
        Ok(())
    }
}

/// Logs every fault with its source and entity context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorHandler;

#[async_trait]
impl ErrorHandler for TracingErrorHandler {
    async fn handle(&self, event: &ErrorEvent) {
        let transient = event.fault.is_transient();
        if transient {
            warn!(
                error_source = %event.source,
                namespace = %event.namespace,
                entity_path = %event.entity_path,
                transient,
                error = %event.fault,
                "message processing fault"
            );
        } else {
            error!(
                error_source = %event.source,
                namespace = %event.namespace,
                entity_path = %event.entity_path,
                transient,
                error = %event.fault,
                "message processing fault"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use pullbridge_core::{QueueName, RawDelivery};

    use super::*;
    use crate::broker::{BrokerClient, ReceiverOptions};
    use crate::buffer::RetentionPolicy;
    use crate::delivery::{AckHandle, SettleState};
    use crate::in_memory_broker::InMemoryBroker;

    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn context_for(broker: &InMemoryBroker, raw: RawDelivery) -> DeliveryContext {
        let queue = QueueName::new("q").unwrap();
        broker.send(&queue, raw);
        let receiver = broker
            .create_receiver(&queue, &ReceiverOptions::default())
            .await
            .unwrap();
        let mut batch = receiver.receive(1, Duration::from_millis(50)).await.unwrap();
        let message = batch.remove(0);
        let ack = AckHandle::new(receiver, message.lock_token);
        DeliveryContext::new(message.raw, ack, CancellationToken::new())
    }

    #[tokio::test]
    async fn buffers_then_completes() {
        let broker = InMemoryBroker::new("local");
        let buffer = Arc::new(IngestionBuffer::new(RetentionPolicy::unbounded()));
        let handler = IngestionHandler::new(buffer.clone());

        let ctx = context_for(&broker, RawDelivery::new("m-1", "hello").with_session_id("s1")).await;
        handler.handle(&ctx).await.unwrap();

        let snap = buffer.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].body_text(), "hello");
        assert_eq!(snap[0].session_id(), Some("s1"));
        assert_eq!(ctx.ack_handle().state(), SettleState::Completed);
        assert_eq!(broker.locked_count(&QueueName::new("q").unwrap()), 0);
    }

    #[tokio::test]
    async fn normalization_failure_leaves_delivery_unsettled() {
        let broker = InMemoryBroker::new("local");
        let buffer = Arc::new(IngestionBuffer::default());
        let handler = IngestionHandler::new(buffer.clone());

        let ctx = context_for(&broker, RawDelivery::new("m-1", "x").with_session_id("bad\u{7}id")).await;
        let err = handler.handle(&ctx).await.unwrap_err();

        assert!(matches!(err, HandlerError::Normalization(_)));
        assert!(buffer.is_empty());
        assert_eq!(ctx.ack_handle().state(), SettleState::Pending);
    }
}
