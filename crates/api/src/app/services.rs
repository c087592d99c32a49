//! Service wiring: ingestion buffer + message processor.

use std::sync::Arc;

use pullbridge_core::ConfigError;
use pullbridge_infra::BridgeConfig;
use pullbridge_ingest::{
    IngestionBuffer, IngestionHandler, Processor, RetentionPolicy, TracingErrorHandler,
};

/// Services shared by every request handler.
#[derive(Debug)]
pub struct AppServices {
    pub buffer: Arc<IngestionBuffer>,
    pub processor: Arc<Processor>,
}

impl AppServices {
    /// Attach a fresh buffer to `processor` and register the ingestion handlers.
    ///
    /// The processor is not started.
    pub fn with_processor(mut processor: Processor, retention: RetentionPolicy) -> Self {
        let buffer = Arc::new(IngestionBuffer::new(retention));
        processor.on_message(IngestionHandler::new(buffer.clone()));
        processor.on_error(TracingErrorHandler);

        Self {
            buffer,
            processor: Arc::new(processor),
        }
    }
}

/// Build services from configuration (broker client, processor, buffer).
pub fn build_services(config: &BridgeConfig) -> Result<AppServices, ConfigError> {
    let processor = pullbridge_infra::initialize(
        &config.connection,
        config.queue_name.as_str(),
        config.processor.clone(),
    )?;

    Ok(AppServices::with_processor(processor, config.retention))
}
