//! Value objects: equality by value, validated on construction.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. Two instances
/// built from the same inputs are interchangeable.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// Longest entity path a broker queue name may have.
pub const MAX_QUEUE_NAME_LEN: usize = 260;

/// Name of the broker queue a processor is bound to.
///
/// Non-empty, at most [`MAX_QUEUE_NAME_LEN`] characters, no whitespace or
/// control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::invalid_queue_name("queue name is empty"));
        }
        if name.chars().count() > MAX_QUEUE_NAME_LEN {
            return Err(ConfigError::invalid_queue_name(format!(
                "queue name exceeds {MAX_QUEUE_NAME_LEN} characters"
            )));
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ConfigError::invalid_queue_name(format!(
                "'{}' contains whitespace or control characters",
                name.escape_debug()
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for QueueName {}

impl core::fmt::Display for QueueName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for QueueName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for QueueName {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}
