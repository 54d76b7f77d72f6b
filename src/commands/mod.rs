//! CLI command implementations.

pub mod check;
pub mod complain;
pub mod config;
pub mod init;
pub mod run;
pub mod status;
pub mod sync_toxic;

use anyhow::Result;

use crate::cmd_abstraction::RealCommandExecutor;
use crate::config::Config;
use crate::firewall::{locate_iptables, warn_if_not_root, Iptables};
use crate::lists::load_ip_file;
use crate::whitelist::Whitelist;

/// Locate iptables and make sure we may use it. Fatal on failure.
pub(crate) fn open_firewall(config: &Config) -> Result<Iptables<RealCommandExecutor>> {
    let program = locate_iptables(config.iptables_path.as_deref())?;
    warn_if_not_root();
    let iptables = Iptables::new(
        RealCommandExecutor::new(),
        program.to_string_lossy().to_string(),
    );
    iptables.check_permissions()?;
    Ok(iptables)
}

pub(crate) fn load_whitelist(config: &Config) -> Result<Whitelist> {
    Ok(load_ip_file(&config.whitelist_path, "whitelist")?
        .into_iter()
        .collect())
}
