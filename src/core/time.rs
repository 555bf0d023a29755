//! Shared timestamp and event-id helpers.
//!
//! All persisted timestamps are ISO-8601 UTC (RFC 3339, microsecond
//! precision) so that lexicographic ordering matches chronological ordering
//! and optimistic-concurrency checks can compare stored strings exactly.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use ulid::Ulid;

/// Current instant as an ISO-8601 UTC string, e.g. `2026-08-01T12:00:00.000000Z`.
pub fn now_iso() -> String {
    to_iso(now_utc())
}

/// Current instant truncated to microseconds, matching the persisted
/// serialization exactly. Anything written to the store uses this so that
/// an in-memory timestamp equals its fetched round-trip.
pub fn now_utc() -> DateTime<Utc> {
    let now = Utc::now();
    let extra_nanos = i64::from(now.timestamp_subsec_nanos() % 1_000);
    now - chrono::Duration::nanoseconds(extra_nanos)
}

/// Canonical serialization used everywhere a timestamp is persisted.
pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored ISO-8601 UTC timestamp. Returns `None` on malformed input.
pub fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Nanoseconds since the Unix epoch, used as the salt in ID derivation.
pub fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_else(|| {
        // Past 2262 the nanosecond clock overflows i64; fall back to micros.
        Utc::now().timestamp_micros().saturating_mul(1000)
    })
}

/// Epoch milliseconds back to a UTC instant (used by GC age math).
pub fn from_epoch_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_iso_round_trips() {
        let raw = now_iso();
        let parsed = parse_iso(&raw).expect("valid timestamp");
        assert_eq!(to_iso(parsed), raw);
    }

    #[test]
    fn test_now_utc_survives_serialization_exactly() {
        let now = now_utc();
        let parsed = parse_iso(&to_iso(now)).expect("valid timestamp");
        assert_eq!(parsed, now);
    }

    #[test]
    fn test_iso_ordering_is_lexicographic() {
        let earlier = to_iso(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let later = to_iso(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 1).unwrap());
        assert!(earlier < later);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_iso("not-a-timestamp").is_none());
        assert!(parse_iso("1771220592Z").is_none());
    }

    #[test]
    fn test_new_event_id_is_unique_ulid() {
        let a = new_event_id();
        let b = new_event_id();
        assert_ne!(a, b);
        assert!(Ulid::from_string(&a).is_ok());
    }
}
