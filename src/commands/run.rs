//! Run command: the long-lived daemon.

use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

use crate::channel::FifoChannel;
use crate::complaints::ComplaintStore;
use crate::config::Config;
use crate::daemon::{Daemon, ListPaths};
use crate::fetcher::HttpFeed;
use crate::firewall::SyncEngine;
use crate::lock::LockGuard;
use crate::signal::{ShutdownGuard, ShutdownToken};
use crate::utils::format_interval;
use crate::validation::validate_feed_url;
use crate::whitelist::Whitelist;

/// Run the run command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let settings = config.daemon_settings()?;
    let iptables = super::open_firewall(&config)?;

    let _lock = LockGuard::acquire(&config.lock_path)?;
    let shutdown = ShutdownGuard::install(ShutdownToken::new());

    let engine = SyncEngine::new(iptables, Whitelist::new());
    let paths = ListPaths {
        whitelist: config.whitelist_path.clone(),
        blacklist: config.blacklist_path.clone(),
        toxic: config.toxic.path.clone(),
    };
    let loop_interval = settings.loop_interval;
    let mut daemon = Daemon::new(engine, settings.clone(), paths, shutdown.token().clone());

    if config.store.enabled {
        info!("Complaint store: {}", config.store.path.display());
        daemon = daemon.with_ban_source(Box::new(ComplaintStore::open(&config.store.path)));
    }

    if !config.toxic.url.is_empty() {
        let url = validate_feed_url(&config.toxic.url)?;
        let feed = HttpFeed::new(url, &config.toxic.path)?;
        info!(
            "Toxic feed: {} every {}",
            feed.url(),
            format_interval(settings.toxic_refresh)
        );
        daemon = daemon.with_feed(Box::new(feed));
    }

    if config.channel.enabled {
        match FifoChannel::open(&config.channel.path) {
            Ok(channel) => daemon = daemon.with_channel(Box::new(channel)),
            Err(e) => warn!("Message channel disabled: {:#}", e),
        }
    }

    info!(
        "chainban {} started, polling every {}",
        env!("CARGO_PKG_VERSION"),
        format_interval(loop_interval)
    );
    daemon.run().await
}
