//! Raw delivery → canonical record.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

use crate::error::NormalizationError;
use crate::message::{MessageRecord, RawDelivery};

/// Longest session identifier a broker accepts.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Normalize one broker delivery.
///
/// - body bytes are copied untouched
/// - the session id is copied verbatim (absent stays absent)
/// - the scheduled-enqueue instant is converted to UTC; the broker's
///   "never scheduled" sentinel (the minimum instant, 0001-01-01) becomes absent
///
/// Pure and deterministic.
pub fn normalize(raw: &RawDelivery) -> Result<MessageRecord, NormalizationError> {
    let session_id = match raw.session_id() {
        Some(s) => Some(validate_session_id(s)?.to_string()),
        None => None,
    };

    let scheduled = raw
        .scheduled_enqueue_time()
        .filter(|at| !is_unscheduled_sentinel(at))
        .map(|at| at.with_timezone(&Utc));

    Ok(MessageRecord::new(raw.body().to_vec(), session_id, scheduled))
}

fn validate_session_id(session_id: &str) -> Result<&str, NormalizationError> {
    let len = session_id.chars().count();
    if len > MAX_SESSION_ID_LEN {
        return Err(NormalizationError::SessionIdTooLong {
            len,
            max: MAX_SESSION_ID_LEN,
        });
    }
    if session_id.chars().any(char::is_control) {
        return Err(NormalizationError::SessionIdControlCharacters);
    }
    Ok(session_id)
}

fn is_unscheduled_sentinel(at: &DateTime<FixedOffset>) -> bool {
    let floor = NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0));
    match floor {
        Some(floor) => at.naive_utc() <= floor,
        None => false,
    }
}
