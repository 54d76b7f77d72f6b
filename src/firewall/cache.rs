//! Snapshot cache of the iptables listing plus a reverse address index.
//!
//! Every mutation invalidates the cache; the next read re-lists. Rule
//! indices in the snapshot are only valid until the next mutation.

use anyhow::Result;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::parser::{parse_listing, Chains};
use super::{Column, Iptables};
use crate::address::Address;
use crate::cmd_abstraction::CommandExecutor;

/// Where an address appears: chain, 1-based rule index and column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub chain: String,
    pub index: usize,
    pub column: Column,
}

/// Reverse index from address to every rule that mentions it.
#[derive(Debug, Clone, Default)]
pub struct AddressIndex {
    entries: HashMap<Address, Vec<Location>>,
}

impl AddressIndex {
    /// Index the source and destination column of every rule.
    ///
    /// Empty values, the `0.0.0.0` wildcard and unparseable values are not
    /// indexed.
    pub fn build(chains: &Chains) -> Self {
        let mut entries: HashMap<Address, Vec<Location>> = HashMap::new();

        for chain in chains.values() {
            for rule in &chain.rules {
                for column in Column::ALL {
                    let Some(value) = rule.column(column) else {
                        continue;
                    };
                    let Ok(addr) = value.parse::<Address>() else {
                        debug!("Not indexing {} {} value {:?}", chain.name, column, value);
                        continue;
                    };
                    if addr.is_any() {
                        continue;
                    }
                    entries.entry(addr).or_default().push(Location {
                        chain: chain.name.clone(),
                        index: rule.index,
                        column,
                    });
                }
            }
        }

        Self { entries }
    }

    /// Every location of `addr`, in chain then rule order.
    pub fn locations(&self, addr: &Address) -> &[Location] {
        self.entries.get(addr).map(Vec::as_slice).unwrap_or_default()
    }

    /// Does `chain` hold `addr` in `column`?
    pub fn chain_has(&self, chain: &str, column: Column, addr: &Address) -> bool {
        self.locations(addr)
            .iter()
            .any(|loc| loc.chain == chain && loc.column == column)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Last parsed listing, refreshed lazily after invalidation.
#[derive(Debug)]
pub struct ChainCache {
    chains: Chains,
    index: AddressIndex,
    dirty: bool,
    refresh_count: usize,
}

impl Default for ChainCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainCache {
    /// Empty cache; the first `refresh` always lists.
    pub fn new() -> Self {
        Self {
            chains: Chains::new(),
            index: AddressIndex::default(),
            dirty: true,
            refresh_count: 0,
        }
    }

    /// Re-list and re-index if invalidated. A failed listing leaves the
    /// cache dirty and returns the error.
    pub fn refresh<E: CommandExecutor>(&mut self, iptables: &Iptables<E>) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let lines = match iptables.list() {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Unable to list iptables chains: {:#}", e);
                return Err(e);
            }
        };

        self.chains = parse_listing(&lines);
        self.index = AddressIndex::build(&self.chains);
        self.dirty = false;
        self.refresh_count += 1;
        debug!(
            "Chain cache refreshed: {} chains, {} addresses",
            self.chains.len(),
            self.index.len()
        );
        Ok(())
    }

    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn chains(&self) -> &Chains {
        &self.chains
    }

    pub fn index(&self) -> &AddressIndex {
        &self.index
    }

    /// Number of listings parsed so far.
    pub fn refresh_count(&self) -> usize {
        self.refresh_count
    }
}
