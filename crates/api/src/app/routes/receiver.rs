//! Receiver endpoints: buffered messages and processor status.

use std::sync::Arc;

use axum::{Extension, Json, Router, routing::get};

use pullbridge_core::MessageRecord;

use crate::app::dto::ReceiverStatus;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/receive", get(receive))
        .route("/status", get(status))
}

/// GET /api/receiver/receive - every buffered message, oldest first.
///
/// Non-destructive: the same messages are returned again on the next call.
pub async fn receive(
    Extension(services): Extension<Arc<AppServices>>,
) -> Json<Vec<Arc<MessageRecord>>> {
    Json(services.buffer.snapshot())
}

/// GET /api/receiver/status - processor session health and buffer counters.
pub async fn status(Extension(services): Extension<Arc<AppServices>>) -> Json<ReceiverStatus> {
    Json(ReceiverStatus {
        processor: services.processor.health(),
        buffer: services.buffer.stats(),
    })
}
