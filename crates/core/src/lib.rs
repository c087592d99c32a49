//! `pullbridge-core`: message model building blocks.
//!
//! This crate contains the **pure** pieces of the bridge: the canonical
//! message record, the raw broker delivery it is built from, and the
//! normalizer between the two. No I/O, no async.

pub mod error;
pub mod id;
pub mod message;
pub mod normalize;
pub mod value_object;

pub use error::{ConfigError, ConfigResult, NormalizationError};
pub use id::{ProcessorId, ReceiverId};
pub use message::{MessageRecord, RawDelivery};
pub use normalize::normalize;
pub use value_object::{QueueName, ValueObject};
