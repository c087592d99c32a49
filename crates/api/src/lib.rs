//! HTTP API: read endpoint over the ingestion buffer, status, health.

pub mod app;
pub mod middleware;
