//! Centralized validation functions for chainban.
//!
//! This module provides unified validation for:
//! - Addresses given on the command line
//! - Time intervals (`30s`, `5m`, `8h`, `7d`)
//! - Feed URLs

use anyhow::{bail, Result};
use std::time::Duration;

use crate::address::Address;
use crate::error::ChainbanError;

/// Validate an IPv4 address or CIDR string and return the parsed [`Address`].
///
/// # Examples
/// ```
/// use chainban::validation::validate_address;
/// assert!(validate_address("192.168.1.1").is_ok());
/// assert!(validate_address("192.168.0.0/24").is_ok());
/// assert!(validate_address("invalid").is_err());
/// assert!(validate_address("0.0.0.0/0").is_err());
/// ```
pub fn validate_address(s: &str) -> Result<Address> {
    let addr = s.parse::<Address>()?;
    if addr.is_any() {
        return Err(ChainbanError::InvalidAddress(s.trim().to_string()).into());
    }
    Ok(addr)
}

/// Interval validation (e.g., "4h", "30m", "1d").
///
/// Only ASCII input is accepted.
///
/// # Examples
/// ```
/// use chainban::validation::is_valid_interval;
/// assert!(is_valid_interval("4h"));
/// assert!(is_valid_interval("30m"));
/// assert!(!is_valid_interval("4x"));
/// assert!(!is_valid_interval(""));
/// ```
pub fn is_valid_interval(interval: &str) -> bool {
    parse_interval(interval).is_ok()
}

/// Parse an interval string into a [`Duration`].
///
/// Accepts formats like: 30s, 5m, 4h, 1d
///
/// # Errors
/// Returns an error with a descriptive message if the interval is invalid.
///
/// # Examples
/// ```
/// use chainban::validation::parse_interval;
/// use std::time::Duration;
/// assert_eq!(parse_interval("2m").unwrap(), Duration::from_secs(120));
/// assert!(parse_interval("invalid").is_err());
/// ```
pub fn parse_interval(interval: &str) -> Result<Duration> {
    if interval.is_empty() {
        bail!("Interval cannot be empty");
    }

    // Reject non-ASCII to prevent Unicode edge cases
    if !interval.is_ascii() {
        bail!("Invalid interval '{}'. Only ASCII characters allowed", interval);
    }

    if interval.len() < 2 {
        bail!("Invalid interval '{}'. Use format like '8h', '30m', '1d'", interval);
    }

    let (num_part, suffix) = interval.split_at(interval.len() - 1);

    let unit: u64 = match suffix {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => bail!("Invalid interval '{}'. Suffix must be s, m, h, or d", interval),
    };

    let Ok(count) = num_part.parse::<u32>() else {
        bail!(
            "Invalid interval '{}'. Number part must be a positive integer",
            interval
        );
    };

    Ok(Duration::from_secs(u64::from(count) * unit))
}

/// Validate an interval and return `()` (for config validation).
pub fn validate_interval(interval: &str) -> Result<()> {
    parse_interval(interval).map(|_| ())
}

/// Validate a feed URL: must parse and use http or https.
///
/// # Examples
/// ```
/// use chainban::validation::validate_feed_url;
/// assert!(validate_feed_url("https://example.com/toxic_ip_cidr.txt").is_ok());
/// assert!(validate_feed_url("ftp://example.com/list").is_err());
/// ```
pub fn validate_feed_url(url: &str) -> Result<reqwest::Url> {
    let parsed = reqwest::Url::parse(url).map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", url, e))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("Feed URL must use http or https: {}", url);
    }
    if parsed.host_str().is_none() {
        bail!("Feed URL has no host: {}", url);
    }
    Ok(parsed)
}
