use serde::Serialize;

use pullbridge_ingest::{BufferStats, SessionHealth};

/// Body of `GET /api/receiver/status`.
#[derive(Debug, Serialize)]
pub struct ReceiverStatus {
    pub processor: SessionHealth,
    pub buffer: BufferStats,
}
