//! Small helpers shared across the codebase.

use chrono::{DateTime, SecondsFormat, Utc};

/// Format a timestamp the way every table column and cursor stores it:
/// RFC 3339, UTC, millisecond precision, `Z` suffix. Fixed-width, so
/// lexicographic comparison matches chronological order.
pub fn to_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time in the canonical timestamp format.
pub fn now_ts() -> String {
    to_ts(Utc::now())
}

/// Truncates a string to at most `max_chars` characters, adding "..." if truncated.
///
/// UTF-8 safe: counts characters, not bytes, so multi-byte input (emoji,
/// CJK) never panics at a boundary.
///
/// # Examples
/// ```
/// use relaybot::utils::truncate_str;
///
/// assert_eq!(truncate_str("hello", 10), "hello");
/// assert_eq!(truncate_str("hello world", 8), "hello...");
/// ```
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    // Byte length <= max_chars implies char count <= max_chars.
    if s.len() <= max_chars {
        return s.to_string();
    }
    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s.to_string();
    }

    const SUFFIX: &str = "...";
    if max_chars <= SUFFIX.len() {
        return SUFFIX.chars().take(max_chars).collect();
    }
    let truncated: String = s.chars().take(max_chars - SUFFIX.len()).collect();
    format!("{}{}", truncated, SUFFIX)
}
