//! Complain command: record complaints against an address.

use anyhow::Result;
use std::path::Path;

use crate::ban_source::Severity;
use crate::complaints::ComplaintStore;
use crate::config::Config;
use crate::error::ChainbanError;
use crate::validation::validate_address;

/// Run the complain command
pub async fn run(addr_str: &str, severity: &str, count: u32, config_path: &Path) -> Result<()> {
    let addr = validate_address(addr_str)
        .map_err(|_| anyhow::anyhow!("Invalid IPv4 address or network: {}", addr_str))?;
    let config = Config::load_or_default(config_path)?;
    if !config.store.enabled {
        return Err(ChainbanError::Configuration(
            "the complaint store is disabled (store.enabled: false)".to_string(),
        )
        .into());
    }

    let severity: Severity = severity.parse().unwrap_or(Severity::Hacking);
    let store = ComplaintStore::open(&config.store.path);
    let total = store.complain(addr, severity, count.max(1))?;

    let threshold = config
        .thresholds
        .by_severity()
        .get(&severity)
        .copied()
        .unwrap_or(1);
    println!(
        "{}: {} complaint(s) at {} (threshold {})",
        addr, total, severity, threshold
    );
    Ok(())
}
