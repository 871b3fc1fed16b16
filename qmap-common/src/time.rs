//! Timestamp utilities

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert seconds to duration
pub fn secs_to_duration(secs: u64) -> std::time::Duration {
    std::time::Duration::from_secs(secs)
}

/// True when `timestamp` is at least `min_age_hours` before `reference`.
///
/// A zero minimum age accepts everything, including timestamps slightly in
/// the future from clock skew between hosts.
pub fn is_at_least_hours_old(
    timestamp: DateTime<Utc>,
    min_age_hours: u64,
    reference: DateTime<Utc>,
) -> bool {
    if min_age_hours == 0 {
        return true;
    }
    let hours = i64::try_from(min_age_hours).unwrap_or(i64::MAX / 3600);
    reference.signed_duration_since(timestamp) >= ChronoDuration::hours(hours)
}
