//! Presence reconciler workers.
//!
//! Two mutually exclusive paths drive agents offline when presence
//! evidence disappears: the keyevent worker reacts to cache expirations,
//! and the periodic reconciler is the fallback when the cache cannot
//! deliver notifications. Exactly one of the two runs.

mod keyevents;
mod reconciler;

pub use keyevents::start_keyevent_worker;
pub use reconciler::start_periodic_reconciler;

use chrono::{DateTime, Duration, TimeZone, Utc};

/// How far back `last_seen_at` is assumed when the cache has already
/// dropped the timestamp.
const MISSING_LAST_SEEN_FALLBACK: Duration = Duration::minutes(2);

/// The `last_seen_at` value to record for an agent forced offline.
///
/// The previously cached timestamp when one survived, otherwise two
/// minutes before now.
fn offline_last_seen(cached_ms: Option<i64>, now: DateTime<Utc>) -> DateTime<Utc> {
    cached_ms
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or(now - MISSING_LAST_SEEN_FALLBACK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_last_seen_recovers_cached_timestamp() {
        let now = Utc::now();
        let cached = now - Duration::seconds(150);

        let recovered = offline_last_seen(Some(cached.timestamp_millis()), now);
        assert_eq!(recovered.timestamp_millis(), cached.timestamp_millis());
    }

    #[test]
    fn test_offline_last_seen_falls_back_two_minutes() {
        let now = Utc::now();
        assert_eq!(offline_last_seen(None, now), now - Duration::minutes(2));
        // An unrepresentable timestamp behaves like a missing one.
        assert_eq!(
            offline_last_seen(Some(i64::MAX), now),
            now - Duration::minutes(2)
        );
    }
}
