//! IPv4 host/network addresses as they appear in ban lists and chain listings.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::ChainbanError;

/// A single IPv4 host or an IPv4 network.
///
/// Hosts are stored as /32 networks and rendered without the suffix, which is
/// also how `iptables --list -n` prints them. Networks are truncated to their
/// base address, so `10.0.0.7/24` and `10.0.0.0/24` are the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(Ipv4Net);

impl Address {
    pub fn host(ip: Ipv4Addr) -> Self {
        Self(Ipv4Net::from(ip))
    }

    /// Base address (the host itself for /32).
    pub fn base(&self) -> Ipv4Addr {
        self.0.network()
    }

    pub fn is_host(&self) -> bool {
        self.0.prefix_len() == 32
    }

    /// The "any address" sentinel `0.0.0.0/0`. Every `/0` truncates to it.
    ///
    /// Never a ban candidate: a rule for it would drop all traffic.
    pub fn is_any(&self) -> bool {
        self.0.prefix_len() == 0
    }

    /// True when `self`'s base address, masked by `network`'s prefix, equals
    /// the network base.
    pub fn within(&self, network: &Address) -> bool {
        network.0.contains(&self.base())
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Self::host(ip)
    }
}

impl FromStr for Address {
    type Err = ChainbanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains('/') {
            let net: Ipv4Net = s
                .parse()
                .map_err(|_| ChainbanError::InvalidAddress(s.to_string()))?;
            Ok(Self(net.trunc()))
        } else {
            let ip: Ipv4Addr = s
                .parse()
                .map_err(|_| ChainbanError::InvalidAddress(s.to_string()))?;
            Ok(Self::host(ip))
        }
    }
}

impl TryFrom<String> for Address {
    type Error = ChainbanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            write!(f, "{}", self.0.addr())
        } else {
            write!(f, "{}/{}", self.0.network(), self.0.prefix_len())
        }
    }
}
