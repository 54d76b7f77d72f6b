//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "chainban")]
#[command(author, version, about = "Keeps iptables block chains in sync with ban lists")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon until SIGINT/SIGTERM
    Run,

    /// Create and link the chainban chains, then exit
    Init,

    /// Download and apply the toxic list once
    SyncToxic,

    /// Show the chains and their blocked addresses
    Status,

    /// Show where an address appears in the chains
    Check {
        /// IPv4 address or CIDR network
        ip: String,
    },

    /// Record complaints against an address
    Complain {
        /// IPv4 address or CIDR network
        ip: String,
        /// known, hacking, suspicious or notice
        #[arg(long, short, default_value = "hacking")]
        severity: String,
        /// Number of complaints to add
        #[arg(long, short = 'n', default_value = "1")]
        count: u32,
    },

    /// Print the effective configuration, or write the default one
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,
        /// Overwrite an existing file with --init
        #[arg(long, requires = "init")]
        force: bool,
    },

    /// Show version
    Version,
}
