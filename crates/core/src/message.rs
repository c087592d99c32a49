//! Raw broker deliveries and the canonical message record built from them.

use std::borrow::Cow;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::value_object::ValueObject;

/// One message as handed over by the broker, before normalization.
///
/// The body is an opaque byte sequence: brokers do not guarantee text
/// payloads. The scheduled-enqueue instant keeps whatever offset the broker
/// reported it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    message_id: String,
    body: Vec<u8>,
    session_id: Option<String>,
    scheduled_enqueue_time: Option<DateTime<FixedOffset>>,
    delivery_count: u32,
}

impl RawDelivery {
    pub fn new(message_id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            session_id: None,
            scheduled_enqueue_time: None,
            delivery_count: 1,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_scheduled_enqueue_time(mut self, at: DateTime<FixedOffset>) -> Self {
        self.scheduled_enqueue_time = Some(at);
        self
    }

    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    /// Broker-assigned message identifier.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn scheduled_enqueue_time(&self) -> Option<DateTime<FixedOffset>> {
        self.scheduled_enqueue_time
    }

    /// How many times the broker has handed this message out (1 on first delivery).
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }
}

/// Canonical, immutable record of one ingested message.
///
/// Serialized for the read endpoint as
/// `{ body, session_id, scheduled_enqueue_time_utc }`, with the body rendered
/// as UTF-8 text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(with = "body_text")]
    body: Vec<u8>,
    session_id: Option<String>,
    scheduled_enqueue_time_utc: Option<DateTime<Utc>>,
}

impl MessageRecord {
    pub fn new(
        body: impl Into<Vec<u8>>,
        session_id: Option<String>,
        scheduled_enqueue_time_utc: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            body: body.into(),
            session_id,
            scheduled_enqueue_time_utc,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as text; invalid UTF-8 sequences are replaced.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn scheduled_enqueue_time_utc(&self) -> Option<DateTime<Utc>> {
        self.scheduled_enqueue_time_utc
    }
}

impl ValueObject for MessageRecord {}

mod body_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        String::deserialize(deserializer).map(String::into_bytes)
    }
}
