//! Infrastructure layer: connection strings, environment config, broker clients.

pub mod broker;
pub mod config;
pub mod connection;

pub use broker::{build_client, initialize};
#[cfg(feature = "redis")]
pub use broker::RedisStreamsBroker;
pub use config::BridgeConfig;
pub use connection::{ConnectionConfig, Transport};
