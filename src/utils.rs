//! Formatting helpers for command output and log lines.

use std::time::Duration;

/// Format a count with K/M suffix for compact display.
///
/// # Examples
/// ```
/// use chainban::utils::format_count;
/// assert_eq!(format_count(500), "500");
/// assert_eq!(format_count(1500), "1.5K");
/// assert_eq!(format_count(1_500_000), "1.5M");
/// ```
pub fn format_count(count: usize) -> String {
    if count >= 1_000_000 {
        format!("{:.1}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.1}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}

/// Render a duration in the largest whole unit of the config interval syntax.
///
/// # Examples
/// ```
/// use chainban::utils::format_interval;
/// use std::time::Duration;
/// assert_eq!(format_interval(Duration::from_secs(86_400)), "1d");
/// assert_eq!(format_interval(Duration::from_secs(90)), "90s");
/// ```
pub fn format_interval(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0 => "0s".to_string(),
        s if s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s % 3600 == 0 => format!("{}h", s / 3600),
        s if s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{}s", s),
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
///
/// # Examples
/// ```
/// use chainban::utils::truncate;
/// assert_eq!(truncate("short", 10), "short");
/// assert_eq!(truncate("this is long", 10), "this is...");
/// ```
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
