//! Time windows built from unsigned config values.

use chrono::{DateTime, TimeDelta, Utc};

/// `secs` as a signed span, saturating at the largest representable one.
pub fn seconds(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

/// The instant `secs` before `from`, clamped to the earliest representable time.
pub fn lookback(from: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    from.checked_sub_signed(seconds(secs))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
