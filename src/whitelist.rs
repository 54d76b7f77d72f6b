//! Whitelist filter: addresses and networks that are never blocked.

use std::collections::{BTreeSet, HashSet};
use tracing::debug;

use crate::address::Address;

/// Whitelisted single hosts plus whitelisted CIDR networks.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    singles: HashSet<Address>,
    networks: Vec<Address>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.singles.len() + self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.singles.is_empty() && self.networks.is_empty()
    }

    /// True if `addr` is a whitelisted single, or falls inside a whitelisted network.
    pub fn covers(&self, addr: &Address) -> bool {
        self.singles.contains(addr) || self.networks.iter().any(|net| addr.within(net))
    }

    /// Return `candidates` minus every whitelisted address and the any-sentinel.
    pub fn filter<'a, I>(&self, candidates: I) -> BTreeSet<Address>
    where
        I: IntoIterator<Item = &'a Address>,
    {
        candidates
            .into_iter()
            .filter(|addr| {
                if addr.is_any() {
                    debug!("Removed {} from list - matches every address", addr);
                    false
                } else if self.covers(addr) {
                    debug!("Removed {} from list - whitelisted", addr);
                    false
                } else {
                    true
                }
            })
            .copied()
            .collect()
    }
}

impl FromIterator<Address> for Whitelist {
    fn from_iter<T: IntoIterator<Item = Address>>(iter: T) -> Self {
        let mut whitelist = Whitelist::new();
        for addr in iter {
            if addr.is_host() {
                whitelist.singles.insert(addr);
            } else if !whitelist.networks.contains(&addr) {
                whitelist.networks.push(addr);
            }
        }
        whitelist
    }
}
