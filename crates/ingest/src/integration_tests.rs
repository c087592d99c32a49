//! Integration tests for the full ingestion pipeline.
//!
//! Tests: InMemoryBroker → Processor → IngestionHandler → IngestionBuffer
//!
//! Verifies:
//! - Concurrent deliveries are buffered without loss or duplication
//! - Absent session ids and scheduled instants stay absent
//! - Faults reach the error handler and never the buffer

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, FixedOffset};

    use pullbridge_core::{QueueName, RawDelivery};

    use crate::broker::{BrokerError, ReceiveMode};
    use crate::buffer::{IngestionBuffer, RetentionPolicy};
    use crate::handler::{ErrorEvent, ErrorHandler, ErrorSource};
    use crate::in_memory_broker::InMemoryBroker;
    use crate::ingestion::IngestionHandler;
    use crate::processor::{Processor, ProcessorConfig};
    use crate::retry::RetryPolicy;
    use crate::session::SessionState;

    #[derive(Clone, Default)]
    struct CollectedErrors(Arc<Mutex<Vec<ErrorEvent>>>);

    #[async_trait]
    impl ErrorHandler for CollectedErrors {
        async fn handle(&self, event: &ErrorEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    impl CollectedErrors {
        fn len(&self) -> usize {
            self.0.lock().unwrap().len()
        }

        fn all(&self) -> Vec<ErrorEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Pipeline {
        broker: InMemoryBroker,
        buffer: Arc<IngestionBuffer>,
        processor: Processor,
        errors: CollectedErrors,
    }

    fn queue() -> QueueName {
        QueueName::new("myqueue").unwrap()
    }

    fn setup(config: ProcessorConfig) -> Pipeline {
        let broker = InMemoryBroker::new("bridge.local");
        let buffer = Arc::new(IngestionBuffer::new(RetentionPolicy::unbounded()));
        let errors = CollectedErrors::default();

        let mut processor =
            Processor::new(Arc::new(broker.clone()), "myqueue", config).unwrap();
        processor.on_message(IngestionHandler::new(buffer.clone()));
        processor.on_error(errors.clone());

        Pipeline {
            broker,
            buffer,
            processor,
            errors,
        }
    }

    fn test_config() -> ProcessorConfig {
        ProcessorConfig {
            max_wait_time: Duration::from_millis(20),
            retry: RetryPolicy::fixed(3, Duration::from_millis(5)),
            ..ProcessorConfig::default()
        }
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn single_delivery_is_buffered_as_sent() {
        let p = setup(test_config());
        p.processor.start().await.unwrap();

        p.broker
            .send(&queue(), RawDelivery::new("m-1", "hello").with_session_id("s1"));
        eventually(|| p.buffer.len() == 1).await;
        p.processor.stop().await.unwrap();

        let snap = p.buffer.snapshot();
        let json = serde_json::to_value(&*snap[0]).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "body": "hello",
                "session_id": "s1",
                "scheduled_enqueue_time_utc": null
            })
        );
        assert_eq!(p.broker.locked_count(&queue()), 0);
        assert!(p.errors.all().is_empty());
    }

    #[tokio::test]
    async fn concurrent_sessions_are_all_buffered() {
        let p = setup(test_config());
        for (i, session) in ["s1", "s2", "s3"].iter().enumerate() {
            p.broker.send(
                &queue(),
                RawDelivery::new(format!("m-{i}"), format!("body-{session}"))
                    .with_session_id(*session),
            );
        }

        p.processor.start().await.unwrap();
        eventually(|| p.buffer.len() == 3).await;
        p.processor.stop().await.unwrap();

        let bodies: HashSet<String> = p
            .buffer
            .snapshot()
            .iter()
            .map(|r| r.body_text().into_owned())
            .collect();
        assert_eq!(
            bodies,
            HashSet::from(["body-s1".into(), "body-s2".into(), "body-s3".into()])
        );
    }

    #[tokio::test]
    async fn many_deliveries_no_loss_no_duplication() {
        let p = setup(ProcessorConfig {
            max_concurrent_deliveries: 8,
            prefetch_count: 16,
            ..test_config()
        });
        p.processor.start().await.unwrap();

        for i in 0..200 {
            p.broker.send(&queue(), RawDelivery::new(format!("m-{i}"), format!("{i}")));
        }
        eventually(|| p.buffer.len() == 200).await;
        p.processor.stop().await.unwrap();

        let unique: HashSet<String> = p
            .buffer
            .snapshot()
            .iter()
            .map(|r| r.body_text().into_owned())
            .collect();
        assert_eq!(unique.len(), 200);
        assert_eq!(p.processor.health().deliveries_completed, 200);
    }

    #[tokio::test]
    async fn scheduled_instant_is_converted_to_utc() {
        let p = setup(test_config());
        let scheduled: DateTime<FixedOffset> =
            DateTime::parse_from_rfc3339("2024-03-01T12:00:00+02:00").unwrap();
        p.broker.send(
            &queue(),
            RawDelivery::new("m-1", "later").with_scheduled_enqueue_time(scheduled),
        );

        p.processor.start().await.unwrap();
        eventually(|| p.buffer.len() == 1).await;
        p.processor.stop().await.unwrap();

        let json = serde_json::to_value(&*p.buffer.snapshot()[0]).unwrap();
        assert_eq!(json["session_id"], serde_json::Value::Null);
        assert_eq!(json["scheduled_enqueue_time_utc"], "2024-03-01T10:00:00Z");
    }

    #[tokio::test]
    async fn fault_before_any_delivery_reaches_error_handler_only() {
        let p = setup(ProcessorConfig {
            retry: RetryPolicy::no_retry(),
            ..test_config()
        });
        p.processor.start().await.unwrap();
        p.broker
            .inject_fault(BrokerError::Unauthorized("listen claim required".into()));

        let mut states = p.processor.watch_state();
        tokio::time::timeout(
            Duration::from_secs(3),
            states.wait_for(|s| *s == SessionState::Faulted),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(p.buffer.snapshot().is_empty());
        let events = p.errors.all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, ErrorSource::Receive);
        assert_eq!(events[0].namespace, "bridge.local");
        assert_eq!(events[0].entity_path, "myqueue");

        p.processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn bad_session_id_is_reported_and_not_buffered() {
        let p = setup(test_config());
        p.broker.send(
            &queue(),
            RawDelivery::new("m-1", "x").with_session_id("s".repeat(200)),
        );
        p.broker.send(&queue(), RawDelivery::new("m-2", "ok"));

        p.processor.start().await.unwrap();
        eventually(|| p.buffer.len() == 1 && p.errors.len() >= 1).await;
        p.processor.stop().await.unwrap();

        assert_eq!(p.buffer.snapshot()[0].body_text(), "ok");
        assert_eq!(p.errors.all()[0].source, ErrorSource::ProcessMessageCallback);
    }

    #[tokio::test]
    async fn receive_and_delete_needs_no_settlement() {
        let p = setup(ProcessorConfig {
            receive_mode: ReceiveMode::ReceiveAndDelete,
            ..test_config()
        });
        p.broker.send(&queue(), RawDelivery::new("m-1", "gone"));

        p.processor.start().await.unwrap();
        eventually(|| p.buffer.len() == 1).await;
        p.processor.stop().await.unwrap();

        assert_eq!(p.broker.ready_count(&queue()), 0);
        assert_eq!(p.broker.locked_count(&queue()), 0);
        assert!(p.errors.all().is_empty());
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_handlers() {
        let p = setup(test_config());
        for i in 0..5 {
            p.broker.send(&queue(), RawDelivery::new(format!("m-{i}"), "x"));
        }
        p.processor.start().await.unwrap();
        eventually(|| p.processor.health().deliveries_received > 0).await;
        p.processor.stop().await.unwrap();

        let health = p.processor.health();
        assert_eq!(health.state, SessionState::Stopped);
        assert_eq!(
            health.deliveries_received,
            health.deliveries_completed + health.deliveries_abandoned
        );
        assert_eq!(p.broker.locked_count(&queue()), 0);
    }

    #[tokio::test]
    async fn unnormalizable_delivery_is_redelivered_a_bounded_number_of_times() {
        let p = setup(ProcessorConfig {
            max_delivery_count: 5,
            ..test_config()
        });
        p.broker
            .send(&queue(), RawDelivery::new("m-1", "x").with_session_id("bad\u{1}"));

        p.processor.start().await.unwrap();
        eventually(|| p.processor.health().deliveries_discarded == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        p.processor.stop().await.unwrap();

        let health = p.processor.health();
        assert_eq!(health.deliveries_received, 5);
        assert_eq!(health.deliveries_abandoned, 4);
        assert!(p.buffer.is_empty());

        let events = p.errors.all();
        let callback_faults = events
            .iter()
            .filter(|e| e.source == ErrorSource::ProcessMessageCallback)
            .count();
        assert_eq!(callback_faults, 5);
        assert_eq!(events.last().unwrap().source, ErrorSource::Discard);
        assert_eq!(p.broker.ready_count(&queue()) + p.broker.locked_count(&queue()), 0);
    }
}
