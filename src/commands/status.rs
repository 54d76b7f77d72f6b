//! Status command implementation.

use anyhow::Result;
use std::path::Path;

use crate::complaints::ComplaintStore;
use crate::config::Config;
use crate::firewall::{Chain, ChainCache, Column, Purpose};
use crate::utils::{format_count, truncate};

/// Longest address list printed per chain.
const MAX_SHOWN: usize = 20;

/// Run the status command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let iptables = super::open_firewall(&config)?;

    let mut cache = ChainCache::new();
    cache.refresh(&iptables)?;

    println!();
    for purpose in Purpose::ALL {
        println!("[{}]", purpose);
        for (name, direction) in purpose.chains() {
            let linked = cache
                .chains()
                .get(direction.parent)
                .is_some_and(|parent| parent.links_to(&name));
            match cache.chains().get(&name) {
                Some(chain) => print_chain(chain, direction.column, linked),
                None => println!("  {:<24} MISSING", truncate(&name, 24)),
            }
        }
        println!();
    }

    let whitelist = super::load_whitelist(&config)?;
    println!("Whitelist entries: {}", format_count(whitelist.len()));
    if config.store.enabled {
        let records = ComplaintStore::open(&config.store.path).records()?;
        println!("Complaint records: {}", format_count(records.len()));
    }
    println!();

    Ok(())
}

fn print_chain(chain: &Chain, column: Column, linked: bool) {
    println!(
        "  {:<24} {} rules{}",
        truncate(&chain.name, 24),
        format_count(chain.rules.len()),
        if linked { "" } else { " (not linked)" }
    );
    let addresses: Vec<&str> = chain
        .rules
        .iter()
        .filter_map(|rule| rule.column(column))
        .collect();
    for addr in addresses.iter().take(MAX_SHOWN) {
        println!("    {}", addr);
    }
    if addresses.len() > MAX_SHOWN {
        println!("    ... and {} more", addresses.len() - MAX_SHOWN);
    }
}
