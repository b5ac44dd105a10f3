//! Monotonic integer nanosecond timestamps shared by every normalized event.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Nanoseconds since the Unix epoch. Zero means "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const UNSET: Timestamp = Timestamp(0);

    pub fn from_nanos(nanos: i64) -> Self {
        Timestamp(nanos)
    }

    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis.saturating_mul(1_000_000))
    }

    pub fn from_micros(micros: i64) -> Self {
        Timestamp(micros.saturating_mul(1_000))
    }

    /// Builds a timestamp from a venue's seconds-as-float wire encoding (Kraken trade `time`).
    pub fn from_secs_f64(secs: f64) -> Self {
        Timestamp((secs * 1_000_000_000.0).round() as i64)
    }

    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(since_epoch.as_nanos() as i64)
    }

    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }

    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    pub fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    /// Formats as `YYYY-MM-DD HH:MM:SS.mmm`, always in UTC.
    pub fn format(&self) -> String {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        match DateTime::<Utc>::from_timestamp(secs, nanos) {
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            None => "0000-00-00 00:00:00.000".to_string(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_is_zero() {
        assert!(Timestamp::UNSET.is_unset());
        assert!(!Timestamp::from_millis(1).is_unset());
    }

    #[test]
    fn from_millis_round_trips_through_as_millis() {
        let ts = Timestamp::from_millis(1_710_000_000_123);
        assert_eq!(ts.as_millis(), 1_710_000_000_123);
    }

    #[test]
    fn from_secs_f64_matches_millis() {
        let ts = Timestamp::from_secs_f64(1_710_000_000.123);
        assert_eq!(ts.as_millis(), 1_710_000_000_123);
    }

    #[test]
    fn format_matches_fixed_pattern() {
        let ts = Timestamp::from_millis(1_710_000_000_123);
        let formatted = ts.format();
        assert_eq!(formatted.len(), "YYYY-MM-DD HH:MM:SS.mmm".len());
        assert!(formatted.contains('-'));
        assert!(formatted.contains(':'));
        assert!(formatted.contains('.'));
    }
}
