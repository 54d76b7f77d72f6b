//! iptables chain management: listing parser, snapshot cache, topology and
//! the diff/sync engine.
//!
//! iptables exposes no stable rule handle, only 1-based positions that shift
//! whenever a lower rule is deleted. Everything here therefore works from a
//! full snapshot of `iptables --list -n -v`, taken again after every mutation.

pub mod cache;
pub mod parser;
pub mod sync;
pub mod topology;

#[cfg(test)]
pub(crate) mod simulator;

use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::cmd_abstraction::{args_to_strings, run_lines, CommandExecutor};
use crate::error::ChainbanError;

pub use cache::{AddressIndex, ChainCache, Location};
pub use parser::{parse_listing, Chain, ChainMeta, Chains, Rule};
pub use sync::{DeltaReport, SyncEngine, SyncReport};

/// Directories searched for the iptables binary in addition to `$PATH`.
const SBIN_DIRS: &[&str] = &["/usr/sbin", "/sbin", "/usr/local/sbin"];

/// Which address column of a rule a chain matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    Source,
    Destination,
}

impl Column {
    pub const ALL: [Column; 2] = [Column::Source, Column::Destination];

    /// Column header as printed by `iptables --list`.
    pub fn header(self) -> &'static str {
        match self {
            Column::Source => "source",
            Column::Destination => "destination",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header())
    }
}

/// One traffic direction: the built-in chain we hook into, the suffix of our
/// chain, the column our block rules match and the iptables flag for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Direction {
    pub parent: &'static str,
    pub suffix: &'static str,
    pub column: Column,
    pub match_flag: &'static str,
}

pub const DIRECTIONS: [Direction; 2] = [
    Direction {
        parent: "INPUT",
        suffix: "-input",
        column: Column::Source,
        match_flag: "-s",
    },
    Direction {
        parent: "OUTPUT",
        suffix: "-output",
        column: Column::Destination,
        match_flag: "-d",
    },
];

/// A category of block list, each owning one chain per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// Externally fed reputation list.
    Toxic,
    /// Locally detected bans from the complaint store and blacklist.
    Ban,
}

impl Purpose {
    pub const ALL: [Purpose; 2] = [Purpose::Toxic, Purpose::Ban];

    pub fn prefix(self) -> &'static str {
        match self {
            Purpose::Toxic => "chainban-toxic",
            Purpose::Ban => "chainban",
        }
    }

    pub fn chain_name(self, direction: &Direction) -> String {
        format!("{}{}", self.prefix(), direction.suffix)
    }

    /// `(chain name, direction)` for both directions.
    pub fn chains(self) -> impl Iterator<Item = (String, &'static Direction)> {
        DIRECTIONS.iter().map(move |d| (self.chain_name(d), d))
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Purpose::Toxic => f.write_str("toxic"),
            Purpose::Ban => f.write_str("ban"),
        }
    }
}

/// Thin wrapper running the iptables binary through a [`CommandExecutor`].
pub struct Iptables<E> {
    executor: E,
    program: String,
}

impl<E: CommandExecutor> Iptables<E> {
    pub fn new(executor: E, program: impl Into<String>) -> Self {
        Self {
            executor,
            program: program.into(),
        }
    }

    /// Full listing of the filter table, numeric, with counters.
    pub fn list(&self) -> Result<Vec<String>> {
        run_lines(&self.executor, &self.program, &args_to_strings(&["--list", "-n", "-v"]))
    }

    /// Run one mutation command.
    pub fn run(&self, args: &[&str]) -> Result<()> {
        debug!("{} {}", self.program, args.join(" "));
        run_lines(&self.executor, &self.program, &args_to_strings(args)).map(|_| ())
    }

    /// Startup check: the binary runs and we may read the INPUT chain.
    pub fn check_permissions(&self) -> Result<()> {
        let args = args_to_strings(&["--list", "INPUT", "-n"]);
        let output = self
            .executor
            .execute(&self.program, &args)
            .map_err(|e| ChainbanError::Configuration(format!("Unable to run {}: {}", self.program, e)))?;
        if !output.success {
            return Err(ChainbanError::Permission(format!(
                "{} --list INPUT failed, you must be root to run chainban: {}",
                self.program,
                output.stderr.trim()
            ))
            .into());
        }
        Ok(())
    }
}

/// Locate the iptables binary: the configured path, else `$PATH` and the sbin dirs.
pub fn locate_iptables(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(ChainbanError::Configuration(format!(
            "iptables_path {} does not exist",
            path.display()
        ))
        .into());
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    let mut dirs: Vec<PathBuf> = std::env::split_paths(&path_var).collect();
    dirs.extend(SBIN_DIRS.iter().map(PathBuf::from));

    dirs.iter()
        .map(|dir| dir.join("iptables"))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            ChainbanError::Configuration(format!(
                "iptables is not installed in {}",
                std::env::join_paths(&dirs)
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default()
            ))
        })
        .context("Unable to locate iptables")
}

/// Warn when not running as root (effective UID != 0).
///
/// Capabilities (CAP_NET_ADMIN) may still allow iptables to work, so this only
/// warns; `Iptables::check_permissions` is the authoritative check.
pub fn warn_if_not_root() {
    // SAFETY: geteuid() has no preconditions and never fails.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        warn!("Running as uid {}; iptables usually requires root or CAP_NET_ADMIN", euid);
    }
}
