use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use pullbridge_infra::BridgeConfig;
use pullbridge_ingest::BrokerClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pullbridge_observability::init();

    let config = BridgeConfig::from_env().context("invalid configuration")?;
    info!(
        transport = %config.connection.transport(),
        namespace = %config.connection.namespace(),
        queue = %config.queue_name,
        "configuration loaded"
    );
    if config.uses_in_process_broker() {
        warn!(
            env = pullbridge_infra::config::ENV_CONNECTION_STRING,
            "using the in-process memory broker; no external producer can reach this queue"
        );
    }

    let services = Arc::new(
        pullbridge_api::app::build_services(&config).context("failed to build services")?,
    );

    services
        .processor
        .start()
        .await
        .context("message processor did not start")?;

    let app = pullbridge_api::app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    info!("shutting down");
    services.processor.stop().await?;
    services.processor.client().close().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
