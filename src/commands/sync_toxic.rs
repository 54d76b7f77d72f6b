//! Sync-toxic command: one forced toxic list synchronization.

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::error;

use crate::config::Config;
use crate::fetcher::{FeedSource, HttpFeed};
use crate::firewall::{Purpose, SyncEngine};
use crate::lists::load_ip_file;
use crate::lock::LockGuard;
use crate::utils::format_count;
use crate::validation::validate_feed_url;

/// Run the sync-toxic command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let iptables = super::open_firewall(&config)?;
    let _lock = LockGuard::acquire(&config.lock_path)?;

    if !config.toxic.url.is_empty() {
        let url = validate_feed_url(&config.toxic.url)?;
        let mut feed = HttpFeed::new(url, &config.toxic.path)?;
        // A failed download still leaves the local copy to sync from.
        if let Err(e) = feed.fetch().await {
            error!("Toxic feed fetch failed: {:#}", e);
        }
    }

    let desired: BTreeSet<_> = load_ip_file(&config.toxic.path, "toxic")?
        .into_iter()
        .collect();
    let mut engine = SyncEngine::new(iptables, super::load_whitelist(&config)?);
    engine.initialize_topology()?;
    let report = engine.synchronize_full(Purpose::Toxic, &desired)?;

    println!();
    println!("Toxic entries: {}", format_count(desired.len()));
    println!("Result: {}", report);
    println!();

    Ok(())
}
