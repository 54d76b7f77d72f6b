//! Init command: create and link the chains, then exit.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::firewall::topology::ensure_topology;
use crate::firewall::{ChainCache, Purpose};
use crate::lock::LockGuard;

/// Run the init command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let iptables = super::open_firewall(&config)?;
    let _lock = LockGuard::acquire(&config.lock_path)?;

    let mut cache = ChainCache::new();
    let changes = ensure_topology(&iptables, &mut cache)?;

    println!();
    if changes == 0 {
        println!("Chains already in place, nothing to do.");
    } else {
        println!("Applied {} topology changes.", changes);
    }
    for purpose in Purpose::ALL {
        for (name, direction) in purpose.chains() {
            println!("  {:<24} <- {}", name, direction.parent);
        }
    }
    println!();

    Ok(())
}
