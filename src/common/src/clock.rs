//! Wall-clock helpers.

use chrono::Utc;

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
