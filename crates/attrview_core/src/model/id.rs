//! Node identifiers and the compact timestamp embedded in them.
//!
//! # Invariants
//! - Node IDs have the shape `YYYYMMDDhhmmss-xxxxxxx` (local time + 7 chars
//!   from `[0-9a-z]`).
//! - The 14-char prefix doubles as the row creation time.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use uuid::Uuid;

/// `chrono` layout of the compact timestamp (`20060102150405` style).
pub const COMPACT_TIME_LAYOUT: &str = "%Y%m%d%H%M%S";
/// Width of the compact timestamp prefix.
pub const COMPACT_TIME_LEN: usize = 14;

const ID_SUFFIX_LEN: usize = 7;
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generates a new node ID stamped with the current local time.
pub fn new_node_id() -> String {
    let suffix: String = Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(ID_SUFFIX_LEN)
        .map(|byte| ID_ALPHABET[usize::from(*byte) % ID_ALPHABET.len()] as char)
        .collect();
    format!("{}-{suffix}", Local::now().format(COMPACT_TIME_LAYOUT))
}

/// Parses the creation time out of a node ID prefix.
///
/// Returns `None` when the ID is shorter than the prefix or the prefix is not
/// a valid local timestamp.
pub fn parse_id_time(id: &str) -> Option<DateTime<Local>> {
    parse_compact_time(id.get(..COMPACT_TIME_LEN)?)
}

/// Parses a `YYYYMMDDhhmmss` local timestamp.
pub fn parse_compact_time(value: &str) -> Option<DateTime<Local>> {
    if value.len() != COMPACT_TIME_LEN {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(value, COMPACT_TIME_LAYOUT).ok()?;
    Local.from_local_datetime(&naive).earliest()
}

/// Formats epoch milliseconds as a compact local timestamp.
pub fn format_compact_time(millis: i64) -> String {
    millis_to_local(millis)
        .format(COMPACT_TIME_LAYOUT)
        .to_string()
}

/// Converts epoch milliseconds into local time, clamping invalid input to now.
pub fn millis_to_local(millis: i64) -> DateTime<Local> {
    Local
        .timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Local::now)
}

/// Current local time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Local::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::{new_node_id, parse_compact_time, parse_id_time, COMPACT_TIME_LEN};
    use chrono::{Datelike, Timelike};

    #[test]
    fn new_node_id_has_timestamp_prefix_and_suffix() {
        let id = new_node_id();
        assert_eq!(id.len(), COMPACT_TIME_LEN + 1 + 7);
        assert_eq!(&id[COMPACT_TIME_LEN..COMPACT_TIME_LEN + 1], "-");
        assert!(parse_id_time(&id).is_some());
    }

    #[test]
    fn parse_id_time_reads_prefix() {
        let parsed = parse_id_time("20240131235958-abcdefg").expect("prefix should parse");
        assert_eq!(parsed.year(), 2024);
        assert_eq!(parsed.month(), 1);
        assert_eq!(parsed.day(), 31);
        assert_eq!(parsed.hour(), 23);
        assert_eq!(parsed.second(), 58);
    }

    #[test]
    fn parse_rejects_short_and_malformed_values() {
        assert!(parse_id_time("2024").is_none());
        assert!(parse_id_time("not-a-timestamp-id").is_none());
        assert!(parse_compact_time("20241399000000").is_none());
    }
}
