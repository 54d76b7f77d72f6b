//! Diff & sync engine: converge a purpose's chains to a desired address set
//! with the fewest `-A`/`-D` commands.
//!
//! Deletion is by position, and deleting rule `n` renumbers every rule after
//! it. All deletes within a chain are therefore issued highest index first,
//! and every mutation marks the cache dirty so the next read re-lists.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info};

use super::cache::ChainCache;
use super::topology::ensure_topology;
use super::{Iptables, Purpose};
use crate::address::Address;
use crate::cmd_abstraction::CommandExecutor;
use crate::whitelist::Whitelist;

/// Outcome of [`SyncEngine::synchronize_full`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Block rules appended.
    pub dropped: usize,
    /// Rules deleted because their address left the desired set.
    pub allowed: usize,
    /// Redundant rules deleted before diffing.
    pub duplicates_removed: usize,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.dropped == 0 && self.allowed == 0 && self.duplicates_removed == 0
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} blocked, {} released, {} duplicates removed",
            self.dropped, self.allowed, self.duplicates_removed
        )
    }
}

/// Outcome of [`SyncEngine::apply_delta`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaReport {
    pub dropped: usize,
    pub allowed: usize,
}

impl fmt::Display for DeltaReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} blocked, {} released", self.dropped, self.allowed)
    }
}

/// Sole writer to the chainban chains.
pub struct SyncEngine<E> {
    iptables: Iptables<E>,
    cache: ChainCache,
    whitelist: Whitelist,
}

impl<E: CommandExecutor> SyncEngine<E> {
    pub fn new(iptables: Iptables<E>, whitelist: Whitelist) -> Self {
        Self {
            iptables,
            cache: ChainCache::new(),
            whitelist,
        }
    }

    pub fn cache(&self) -> &ChainCache {
        &self.cache
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn set_whitelist(&mut self, whitelist: Whitelist) {
        self.whitelist = whitelist;
    }

    /// Re-list if a mutation happened since the last listing.
    pub fn refresh(&mut self) -> Result<()> {
        self.cache.refresh(&self.iptables)
    }

    pub fn initialize_topology(&mut self) -> Result<usize> {
        ensure_topology(&self.iptables, &mut self.cache)
    }

    /// Run one mutation. The cache is invalidated whether or not it succeeded.
    fn mutate(&mut self, args: &[&str]) -> Result<()> {
        let result = self.iptables.run(args);
        self.cache.invalidate();
        result
    }

    /// Addresses each of `purpose`'s chains holds in its directional column.
    fn chain_sets(&mut self, purpose: Purpose) -> Result<Vec<BTreeSet<Address>>> {
        self.refresh()?;
        let chains = self.cache.chains();

        Ok(purpose
            .chains()
            .map(|(name, direction)| {
                chains
                    .get(&name)
                    .map(|chain| {
                        chain
                            .rules
                            .iter()
                            .filter_map(|rule| rule.column(direction.column))
                            .filter_map(|value| value.parse::<Address>().ok())
                            .filter(|addr| !addr.is_any())
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect())
    }

    /// Every address currently blocked by `purpose`, in either direction.
    pub fn chain_ips(&mut self, purpose: Purpose) -> Result<BTreeSet<Address>> {
        Ok(self.chain_sets(purpose)?.into_iter().flatten().collect())
    }

    /// Full reconciliation of `purpose` against `desired`.
    ///
    /// Duplicates are removed first, then `desired` (minus the whitelist) is
    /// diffed against the chains: missing addresses are blocked, extra ones
    /// released. A second call with the same set issues no commands.
    pub fn synchronize_full(
        &mut self,
        purpose: Purpose,
        desired: &BTreeSet<Address>,
    ) -> Result<SyncReport> {
        self.refresh()?;
        let duplicates_removed = self.remove_duplicates(purpose)?;
        self.refresh()?;

        let sets = self.chain_sets(purpose)?;
        let current: BTreeSet<Address> = sets.iter().flatten().copied().collect();
        let desired = self.whitelist.filter(desired);

        // Addresses missing from at least one direction still need a rule there.
        let to_drop: BTreeSet<Address> = desired
            .iter()
            .filter(|addr| !sets.iter().all(|set| set.contains(addr)))
            .copied()
            .collect();
        let to_allow: BTreeSet<Address> = current.difference(&desired).copied().collect();

        debug!(
            "Full sync of {}: {} desired, {} present, {} to block, {} to release",
            purpose,
            desired.len(),
            current.len(),
            to_drop.len(),
            to_allow.len()
        );

        let dropped = self.drop_filtered(purpose, &to_drop)?;
        let allowed = self.allow(purpose, &to_allow)?;

        Ok(SyncReport {
            dropped,
            allowed,
            duplicates_removed,
        })
    }

    /// Incremental update for one poll tick. An address in both `ban` and
    /// `allow` is released, never blocked.
    pub fn apply_delta(
        &mut self,
        purpose: Purpose,
        ban: &BTreeSet<Address>,
        allow: &BTreeSet<Address>,
    ) -> Result<DeltaReport> {
        let candidates: BTreeSet<Address> = ban.difference(allow).copied().collect();
        let to_drop = self.whitelist.filter(&candidates);

        let dropped = self.drop_filtered(purpose, &to_drop)?;
        let allowed = self.allow(purpose, allow)?;

        Ok(DeltaReport { dropped, allowed })
    }

    /// Block `addresses` in both of `purpose`'s chains. Whitelisted addresses
    /// and addresses a chain already holds are skipped.
    ///
    /// Returns the number of rules appended.
    pub fn drop(&mut self, purpose: Purpose, addresses: &BTreeSet<Address>) -> Result<usize> {
        let addresses = self.whitelist.filter(addresses);
        self.drop_filtered(purpose, &addresses)
    }

    fn drop_filtered(&mut self, purpose: Purpose, addresses: &BTreeSet<Address>) -> Result<usize> {
        if addresses.is_empty() {
            return Ok(0);
        }
        self.refresh()?;

        let mut planned = Vec::new();
        for (name, direction) in purpose.chains() {
            for addr in addresses {
                if self.cache.index().chain_has(&name, direction.column, addr) {
                    debug!("{} already blocked in {}", addr, name);
                    continue;
                }
                planned.push((name.clone(), direction.match_flag, addr.to_string()));
            }
        }

        let mut appended = 0;
        for (chain, flag, addr) in &planned {
            info!("Blocking {} in {}", addr, chain);
            self.mutate(&["-A", chain, flag, addr, "-j", "DROP"])?;
            appended += 1;
        }
        Ok(appended)
    }

    /// Delete every rule in `purpose`'s chains that mentions one of
    /// `addresses`, highest index first within each chain.
    ///
    /// Returns the number of rules deleted.
    pub fn allow(&mut self, purpose: Purpose, addresses: &BTreeSet<Address>) -> Result<usize> {
        if addresses.is_empty() {
            return Ok(0);
        }
        self.refresh()?;

        let names: BTreeSet<String> = purpose.chains().map(|(name, _)| name).collect();
        let mut doomed: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
        for addr in addresses {
            for location in self.cache.index().locations(addr) {
                if names.contains(&location.chain) {
                    doomed
                        .entry(location.chain.clone())
                        .or_default()
                        .insert(location.index);
                }
            }
        }

        if doomed.is_empty() {
            return Ok(0);
        }
        self.delete_descending(&doomed)
    }

    /// Delete later occurrences of any address repeated within one of
    /// `purpose`'s chains, keeping the first.
    ///
    /// Returns the number of rules deleted.
    pub fn remove_duplicates(&mut self, purpose: Purpose) -> Result<usize> {
        self.refresh()?;

        let mut doomed: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
        for (name, direction) in purpose.chains() {
            let Some(chain) = self.cache.chains().get(&name) else {
                continue;
            };
            let mut seen = BTreeSet::new();
            for rule in &chain.rules {
                let Some(addr) = rule
                    .column(direction.column)
                    .and_then(|value| value.parse::<Address>().ok())
                else {
                    continue;
                };
                if addr.is_any() {
                    continue;
                }
                if !seen.insert(addr) {
                    debug!("Duplicate {} at index {} in {}", addr, rule.index, name);
                    doomed.entry(name.clone()).or_default().insert(rule.index);
                }
            }
        }

        if doomed.is_empty() {
            return Ok(0);
        }
        self.delete_descending(&doomed)
    }

    fn delete_descending(&mut self, doomed: &BTreeMap<String, BTreeSet<usize>>) -> Result<usize> {
        let mut deleted = 0;
        for (chain, indices) in doomed {
            for index in indices.iter().rev() {
                info!("Removing index {} from {}", index, chain);
                self.mutate(&["-D", chain, &index.to_string()])?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
