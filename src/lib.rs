//! # chainban - iptables ban chain synchronizer
//!
//! Keeps two families of iptables chains in line with externally supplied
//! address lists: a *toxic* family fed by a downloaded list of known-bad
//! networks, and a *ban* family fed by a complaint store and a local
//! blacklist. Each family has one chain hooked into `INPUT` (matching the
//! source column) and one hooked into `OUTPUT` (matching the destination).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  CLI (clap): run, init, sync-toxic, status, check, ...      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Daemon loop                                                │
//! │    ├── MessageChannel (FIFO)                                │
//! │    ├── BanSource (complaint store)                          │
//! │    ├── FeedSource (HTTP toxic list)                         │
//! │    └── WatchedList (whitelist, blacklist, toxic files)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  firewall                                                   │
//! │    ├── parser:   `iptables --list -n -v` -> Chains          │
//! │    ├── cache:    snapshot + AddressIndex                    │
//! │    ├── topology: create and link chains                     │
//! │    └── sync:     full sync, delta, drop, allow, dedup       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CommandExecutor (mockable process runner)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use chainban::address::Address;
//! use chainban::cmd_abstraction::RealCommandExecutor;
//! use chainban::firewall::{Iptables, Purpose, SyncEngine};
//! use chainban::whitelist::Whitelist;
//! use std::collections::BTreeSet;
//!
//! fn main() -> anyhow::Result<()> {
//!     let iptables = Iptables::new(RealCommandExecutor::new(), "/usr/sbin/iptables");
//!     let whitelist: Whitelist = ["10.0.0.0/8".parse::<Address>()?].into_iter().collect();
//!     let mut engine = SyncEngine::new(iptables, whitelist);
//!
//!     engine.initialize_topology()?;
//!     let desired: BTreeSet<Address> = ["203.0.113.7".parse()?].into_iter().collect();
//!     let report = engine.synchronize_full(Purpose::Ban, &desired)?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`address`] - IPv4 host/network type
//! - [`ban_source`] - Severities and the ban candidate interface
//! - [`channel`] - FIFO message channel
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - Process execution abstraction
//! - [`commands`] - CLI command implementations
//! - [`complaints`] - JSON-backed complaint store
//! - [`config`] - Configuration parsing and validation
//! - [`daemon`] - The polling loop
//! - [`fetcher`] - Conditional HTTP download of the toxic list
//! - [`firewall`] - Listing parser, cache, topology and sync engine
//! - [`lists`] - Address list files
//! - [`lock`] - Single-instance file lock
//! - [`signal`] - Graceful shutdown handling
//! - [`whitelist`] - Never-block filter

pub mod address;
pub mod ban_source;
pub mod channel;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod complaints;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fetcher;
pub mod firewall;
pub mod lists;
pub mod lock;
pub mod signal;
pub mod utils;
pub mod validation;
pub mod whitelist;

pub use address::Address;
pub use cli::{Cli, Commands};
pub use config::Config;
pub use error::ChainbanError;
