//! Core error model.

use thiserror::Error;

/// Result type used for configuration parsing and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Invalid or missing configuration at initialization.
///
/// Always fatal to startup: the bridge cannot subscribe without a valid
/// connection string and queue name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting was not provided.
    #[error("missing configuration value: {0}")]
    Missing(&'static str),

    /// The broker connection string could not be parsed.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// The queue name was empty or malformed.
    #[error("invalid queue name: {0}")]
    InvalidQueueName(String),

    /// A tuning option had an unparseable or out-of-range value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    /// The connection string names a transport this build does not support.
    #[error("unsupported broker transport: {0}")]
    UnsupportedTransport(String),
}

impl ConfigError {
    pub fn invalid_connection_string(msg: impl Into<String>) -> Self {
        Self::InvalidConnectionString(msg.into())
    }

    pub fn invalid_queue_name(msg: impl Into<String>) -> Self {
        Self::InvalidQueueName(msg.into())
    }

    pub fn invalid_value(key: &'static str, msg: impl Into<String>) -> Self {
        Self::InvalidValue {
            key,
            message: msg.into(),
        }
    }
}

/// A delivery whose content cannot be turned into a [`crate::MessageRecord`].
///
/// Raised at the delivery-handler boundary; the delivery is released back to
/// the broker instead of being acknowledged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    /// Session identifiers are capped by the broker protocol.
    #[error("session id is {len} characters long (max {max})")]
    SessionIdTooLong { len: usize, max: usize },

    /// Session identifiers must be printable.
    #[error("session id contains control characters")]
    SessionIdControlCharacters,
}
