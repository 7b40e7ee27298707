//! The canonical timestamp serializer.
//!
//! # Contract
//!
//! Every code path that writes, compares, or transmits a point in time goes
//! through [`to_canonical`]: the store's INSERT, the duplicate-window
//! bound, and the wire body all share one serialization. Timestamp format
//! drift between a write path and a compare path is a known class of silent
//! dedup bugs; funneling through a single function makes it unrepresentable.
//!
//! The format is RFC3339 UTC with a trailing `Z` and a fixed six-digit
//! fractional second (`2026-08-01T10:00:00.000000Z`). Fixed width matters:
//! it makes lexicographic comparison of stored text equivalent to
//! chronological comparison, which the store's window queries rely on.

use chrono::{DateTime, SecondsFormat, Utc};

/// Serialize an instant in the canonical on-disk / on-wire form.
pub fn to_canonical(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a canonical (or any RFC3339) timestamp back to UTC.
pub fn parse_canonical(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc))
}
