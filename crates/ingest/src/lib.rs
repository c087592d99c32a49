//! `pullbridge-ingest`: the message-ingestion pipeline.
//!
//! ```text
//! Broker ─► Processor (N concurrent deliveries) ─► normalize ─► IngestionBuffer ◄─ snapshot
//! ```
//!
//! The broker itself is abstracted behind [`BrokerClient`] / [`DeliveryReceiver`];
//! [`InMemoryBroker`] implements them for dev and tests.

pub mod broker;
pub mod buffer;
pub mod delivery;
pub mod handler;
pub mod in_memory_broker;
pub mod ingestion;
pub mod processor;
pub mod retry;
pub mod session;

mod integration_tests;

pub use broker::{
    BrokerClient, BrokerError, DeliveryReceiver, LockToken, ReceiveMode, ReceivedMessage,
    ReceiverOptions,
};
pub use buffer::{BufferStats, IngestionBuffer, RetentionPolicy};
pub use delivery::{AckHandle, DeliveryContext, SettleState};
pub use handler::{DeliveryFault, ErrorEvent, ErrorHandler, ErrorSource, HandlerError, MessageHandler};
pub use in_memory_broker::InMemoryBroker;
pub use ingestion::{IngestionHandler, TracingErrorHandler};
pub use processor::{Processor, ProcessorConfig, ProcessorError};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use session::{FaultRecord, SessionHealth, SessionState};
