//! Severity levels and the interface the daemon pulls ban/allow candidates from.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

use crate::address::Address;

/// How confident we are that an address is malicious. Lower is worse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Already known bad elsewhere; never expires.
    Known,
    Hacking,
    Suspicious,
    Notice,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Known,
        Severity::Hacking,
        Severity::Suspicious,
        Severity::Notice,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Known => "known",
            Severity::Hacking => "hacking",
            Severity::Suspicious => "suspicious",
            Severity::Notice => "notice",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lenient: case and non-letters are ignored, anything unrecognised is
/// treated as `hacking`.
impl FromStr for Severity {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let letters: String = s
            .chars()
            .filter(char::is_ascii_alphabetic)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Ok(match letters.as_str() {
            "known" => Severity::Known,
            "suspicious" => Severity::Suspicious,
            "notice" => Severity::Notice,
            _ => Severity::Hacking,
        })
    }
}

/// Where ban and release decisions come from.
#[cfg_attr(test, automock)]
pub trait BanSource: Send {
    /// Addresses whose complaint count at their severity reaches that
    /// severity's threshold, limited to records touched at or after `since`.
    /// `None` returns the full qualifying set.
    fn addresses_to_ban(
        &mut self,
        since: Option<DateTime<Utc>>,
        thresholds: &BTreeMap<Severity, u32>,
    ) -> Result<BTreeSet<Address>>;

    /// Addresses whose last activity is older than `now - ttl` for their
    /// severity. Matched records are deleted, so each address is returned
    /// at most once. Severities without a TTL never expire.
    fn addresses_to_allow(
        &mut self,
        now: DateTime<Utc>,
        ttls: &BTreeMap<Severity, Duration>,
    ) -> Result<BTreeSet<Address>>;

    /// Forget records idle since before `cutoff` that never reached a ban
    /// threshold. Returns how many were dropped.
    fn cull(&mut self, cutoff: DateTime<Utc>, thresholds: &BTreeMap<Severity, u32>)
        -> Result<usize>;
}
