//! Time utilities for netwarden
//!
//! Timestamps stored in the remote state document are Unix milliseconds.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{NaiveTime, Timelike};

/// Get the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
///
/// # Examples
/// ```
/// use nw_core::time::current_time_millis;
///
/// let now = current_time_millis();
/// assert!(now > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Calculate elapsed time in milliseconds since a given timestamp.
///
/// Returns 0 if the given time is in the future.
pub fn elapsed_millis(since: u64) -> u64 {
    current_time_millis().saturating_sub(since)
}

/// Current local wall-clock time, truncated to the minute.
pub fn local_time_of_day() -> NaiveTime {
    let now = chrono::Local::now().time();
    NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap_or(NaiveTime::MIN)
}

/// Parse an `HH:MM` clock string.
pub fn parse_clock(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// Whether `now` falls inside `[start, end)`; windows with `end <= start` wrap midnight.
pub fn in_window(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start < end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_current_time_millis_is_positive() {
        assert!(current_time_millis() > 0);
    }

    #[test]
    fn test_elapsed_millis() {
        let now = current_time_millis();
        std::thread::sleep(Duration::from_millis(10));
        assert!(elapsed_millis(now) >= 10);
    }

    #[test]
    fn test_elapsed_millis_future_time() {
        let future = current_time_millis() + 1_000_000;
        assert_eq!(elapsed_millis(future), 0);
    }

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("07:30"), NaiveTime::from_hms_opt(7, 30, 0));
        assert_eq!(parse_clock(" 23:05 "), NaiveTime::from_hms_opt(23, 5, 0));
        assert!(parse_clock("25:00").is_none());
        assert!(parse_clock("noon").is_none());
    }

    #[test]
    fn test_in_window_same_day() {
        let start = parse_clock("08:00").unwrap();
        let end = parse_clock("17:00").unwrap();
        assert!(in_window(parse_clock("08:00").unwrap(), start, end));
        assert!(in_window(parse_clock("12:30").unwrap(), start, end));
        assert!(!in_window(parse_clock("17:00").unwrap(), start, end));
        assert!(!in_window(parse_clock("03:00").unwrap(), start, end));
    }

    #[test]
    fn test_in_window_wraps_midnight() {
        let start = parse_clock("22:00").unwrap();
        let end = parse_clock("06:00").unwrap();
        assert!(in_window(parse_clock("23:15").unwrap(), start, end));
        assert!(in_window(parse_clock("01:00").unwrap(), start, end));
        assert!(!in_window(parse_clock("06:00").unwrap(), start, end));
        assert!(!in_window(parse_clock("12:00").unwrap(), start, end));
    }
}
