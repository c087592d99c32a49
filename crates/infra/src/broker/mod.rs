//! Infrastructure broker clients and the processor factory.
//!
//! The broker abstraction lives in `pullbridge-ingest` as pure mechanics.
//! This module picks an implementation from a [`ConnectionConfig`].

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;

use std::sync::Arc;

use tracing::info;

use pullbridge_core::{ConfigError, ConfigResult};
use pullbridge_ingest::{BrokerClient, InMemoryBroker, Processor, ProcessorConfig};

use crate::connection::{ConnectionConfig, Transport};

/// Construct the broker client a connection string names.
pub fn build_client(connection: &ConnectionConfig) -> ConfigResult<Arc<dyn BrokerClient>> {
    let client: Arc<dyn BrokerClient> = match connection.transport() {
        Transport::Memory => Arc::new(InMemoryBroker::new(connection.namespace())),
        #[cfg(feature = "redis")]
        Transport::Redis => Arc::new(RedisStreamsBroker::connect(connection)?),
        #[cfg(not(feature = "redis"))]
        Transport::Redis => {
            return Err(ConfigError::UnsupportedTransport(
                "redis (built without the `redis` feature)".to_string(),
            ));
        }
    };

    info!(
        transport = %connection.transport(),
        namespace = %connection.namespace(),
        "broker client created"
    );
    Ok(client)
}

/// Build a client and a processor bound to `queue_name`.
///
/// Handlers still have to be registered on the returned processor before
/// `start()`.
pub fn initialize(
    connection: &ConnectionConfig,
    queue_name: &str,
    config: ProcessorConfig,
) -> ConfigResult<Processor> {
    if queue_name.trim().is_empty() {
        return Err(ConfigError::invalid_queue_name("queue name is empty"));
    }
    let client = build_client(connection)?;
    Processor::new(client, queue_name, config)
}
