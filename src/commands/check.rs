//! Check command implementation.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::firewall::ChainCache;
use crate::validation::validate_address;

/// Run the check command
pub async fn run(addr_str: &str, config_path: &Path) -> Result<()> {
    let addr = validate_address(addr_str)
        .map_err(|_| anyhow::anyhow!("Invalid IPv4 address or network: {}", addr_str))?;

    let config = Config::load_or_default(config_path)?;
    let whitelist = super::load_whitelist(&config)?;
    let iptables = super::open_firewall(&config)?;

    let mut cache = ChainCache::new();
    cache.refresh(&iptables)?;
    let locations = cache.index().locations(&addr);

    println!();
    if locations.is_empty() {
        println!("{} is NOT in any chain", addr);
    } else {
        println!("{} found in {} rule(s):", addr, locations.len());
        for loc in locations {
            println!("  {} rule {} ({})", loc.chain, loc.index, loc.column);
        }
    }
    if whitelist.covers(&addr) {
        println!("{} is WHITELISTED", addr);
    }
    println!();

    Ok(())
}
