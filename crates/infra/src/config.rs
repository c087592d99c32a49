//! Configuration loading from the process environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use pullbridge_core::{ConfigError, ConfigResult, QueueName};
use pullbridge_ingest::{ProcessorConfig, ReceiveMode, RetentionPolicy};

use crate::connection::{ConnectionConfig, Transport};

pub const ENV_CONNECTION_STRING: &str = "BRIDGE_CONNECTION_STRING";
pub const ENV_QUEUE_NAME: &str = "BRIDGE_QUEUE_NAME";
pub const ENV_AUTO_COMPLETE: &str = "BRIDGE_AUTO_COMPLETE";
pub const ENV_MAX_CONCURRENT_DELIVERIES: &str = "BRIDGE_MAX_CONCURRENT_DELIVERIES";
pub const ENV_PREFETCH_COUNT: &str = "BRIDGE_PREFETCH_COUNT";
pub const ENV_RECEIVE_MODE: &str = "BRIDGE_RECEIVE_MODE";
pub const ENV_BUFFER_CAPACITY: &str = "BRIDGE_BUFFER_CAPACITY";
pub const ENV_BUFFER_MAX_AGE_SECS: &str = "BRIDGE_BUFFER_MAX_AGE_SECS";
pub const ENV_START_TIMEOUT_SECS: &str = "BRIDGE_START_TIMEOUT_SECS";
pub const ENV_MAX_DELIVERY_COUNT: &str = "BRIDGE_MAX_DELIVERY_COUNT";
pub const ENV_LISTEN_ADDR: &str = "BRIDGE_LISTEN_ADDR";

pub const DEFAULT_CONNECTION_STRING: &str = "Endpoint=memory://local";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Everything the bridge binary needs to start.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub connection: ConnectionConfig,
    pub queue_name: QueueName,
    pub processor: ProcessorConfig,
    pub retention: RetentionPolicy,
    pub listen_addr: SocketAddr,
}

impl BridgeConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup` (`None` = variable not set).
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let connection = ConnectionConfig::parse(
            var(ENV_CONNECTION_STRING)
                .as_deref()
                .unwrap_or(DEFAULT_CONNECTION_STRING),
        )?;

        let queue_name = QueueName::new(
            var(ENV_QUEUE_NAME).ok_or(ConfigError::Missing(ENV_QUEUE_NAME))?,
        )?;

        let defaults = ProcessorConfig::default();
        let processor = ProcessorConfig {
            auto_complete: parse_or(var(ENV_AUTO_COMPLETE), ENV_AUTO_COMPLETE, defaults.auto_complete, parse_bool)?,
            max_concurrent_deliveries: parse_or(
                var(ENV_MAX_CONCURRENT_DELIVERIES),
                ENV_MAX_CONCURRENT_DELIVERIES,
                defaults.max_concurrent_deliveries,
                parse_number,
            )?,
            prefetch_count: parse_or(var(ENV_PREFETCH_COUNT), ENV_PREFETCH_COUNT, defaults.prefetch_count, parse_number)?,
            receive_mode: match var(ENV_RECEIVE_MODE) {
                Some(v) => ReceiveMode::from_str(&v)?,
                None => defaults.receive_mode,
            },
            start_timeout: parse_or(
                var(ENV_START_TIMEOUT_SECS),
                ENV_START_TIMEOUT_SECS,
                defaults.start_timeout,
                parse_secs,
            )?,
            max_delivery_count: parse_or(
                var(ENV_MAX_DELIVERY_COUNT),
                ENV_MAX_DELIVERY_COUNT,
                defaults.max_delivery_count,
                parse_number,
            )?,
            ..defaults
        };
        processor.validate()?;

        let mut retention = RetentionPolicy::default();
        if let Some(v) = var(ENV_BUFFER_CAPACITY) {
            retention = retention.with_capacity(parse_number(&v).map_err(|m| {
                ConfigError::invalid_value(ENV_BUFFER_CAPACITY, m)
            })?);
        }
        if let Some(v) = var(ENV_BUFFER_MAX_AGE_SECS) {
            retention = retention.with_max_age(
                parse_secs(&v).map_err(|m| ConfigError::invalid_value(ENV_BUFFER_MAX_AGE_SECS, m))?,
            );
        }

        let listen_addr = parse_or(
            var(ENV_LISTEN_ADDR),
            ENV_LISTEN_ADDR,
            SocketAddr::from(([0, 0, 0, 0], 8080)),
            |v| SocketAddr::from_str(v).map_err(|e| e.to_string()),
        )?;

        Ok(Self {
            connection,
            queue_name,
            processor,
            retention,
            listen_addr,
        })
    }

    /// True when the broker lives inside this process, so only code in the
    /// same process can send to the queue.
    pub fn uses_in_process_broker(&self) -> bool {
        self.connection.transport() == Transport::Memory
    }
}

fn parse_or<T>(
    value: Option<String>,
    key: &'static str,
    default: T,
    parse: impl Fn(&str) -> Result<T, String>,
) -> ConfigResult<T> {
    match value {
        Some(v) => parse(v.trim()).map_err(|m| ConfigError::invalid_value(key, m)),
        None => Ok(default),
    }
}

fn parse_bool(v: &str) -> Result<bool, String> {
    match v.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(format!("'{v}' is not a boolean")),
    }
}

fn parse_number<T>(v: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    v.trim()
        .parse::<T>()
        .map_err(|e| format!("'{v}': {e}"))
}

fn parse_secs(v: &str) -> Result<Duration, String> {
    let secs: u64 = parse_number(v)?;
    if secs == 0 {
        return Err("must be at least 1 second".to_string());
    }
    Ok(Duration::from_secs(secs))
}
