//! The daemon loop.
//!
//! One tick: poll the message channel, pull ban/allow candidates, apply
//! them, sleep, then refresh the toxic list and the whitelist if needed.
//! Only startup topology errors are fatal; everything else is logged and
//! retried on a later tick from a fresh listing.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::address::Address;
use crate::ban_source::BanSource;
use crate::channel::MessageChannel;
use crate::cmd_abstraction::CommandExecutor;
use crate::config::DaemonSettings;
use crate::fetcher::FeedSource;
use crate::firewall::{Purpose, SyncEngine};
use crate::lists::WatchedList;
use crate::signal::ShutdownToken;
use crate::whitelist::Whitelist;

/// Wait before retrying a failed feed download.
const FEED_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Files the daemon watches for changes.
#[derive(Debug, Clone)]
pub struct ListPaths {
    pub whitelist: std::path::PathBuf,
    pub blacklist: std::path::PathBuf,
    pub toxic: std::path::PathBuf,
}

pub struct Daemon<E> {
    engine: SyncEngine<E>,
    settings: DaemonSettings,
    ban_source: Option<Box<dyn BanSource>>,
    feed: Option<Box<dyn FeedSource>>,
    channel: Option<Box<dyn MessageChannel>>,
    whitelist: WatchedList,
    blacklist: WatchedList,
    toxic: WatchedList,
    /// Time of the last successful ban check; `None` forces a full sync.
    last_check: Option<DateTime<Utc>>,
    /// Allow candidates already removed from the store but not yet applied.
    pending_allow: BTreeSet<Address>,
    /// When the feed is next downloaded; `None` means now.
    next_fetch: Option<Instant>,
    /// Resync the toxic chains from the local file even if it is unchanged.
    toxic_resync: bool,
    last_cull: Option<DateTime<Utc>>,
    token: ShutdownToken,
}

impl<E: CommandExecutor> Daemon<E> {
    pub fn new(
        engine: SyncEngine<E>,
        settings: DaemonSettings,
        paths: ListPaths,
        token: ShutdownToken,
    ) -> Self {
        Self {
            engine,
            settings,
            ban_source: None,
            feed: None,
            channel: None,
            whitelist: WatchedList::new(paths.whitelist, "whitelist"),
            blacklist: WatchedList::new(paths.blacklist, "blacklist"),
            toxic: WatchedList::new(paths.toxic, "toxic"),
            last_check: None,
            pending_allow: BTreeSet::new(),
            next_fetch: None,
            toxic_resync: false,
            last_cull: None,
            token,
        }
    }

    pub fn with_ban_source(mut self, source: Box<dyn BanSource>) -> Self {
        self.ban_source = Some(source);
        self
    }

    pub fn with_feed(mut self, feed: Box<dyn FeedSource>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_channel(mut self, channel: Box<dyn MessageChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn engine(&self) -> &SyncEngine<E> {
        &self.engine
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.last_check
    }

    /// Start up, then tick until the shutdown token is cancelled.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        while !self.token.is_cancelled() {
            self.tick().await;
        }
        info!("Shutting down");
        Ok(())
    }

    /// Topology (fatal on failure), whitelist, forced toxic sync and the
    /// initial full ban sync.
    pub async fn start(&mut self) -> Result<()> {
        let created = self
            .engine
            .initialize_topology()
            .context("Unable to initialize chains")?;
        if created > 0 {
            info!("Chain topology initialized ({} changes)", created);
        }

        if let Err(e) = self.reload_whitelist() {
            error!("Unable to load whitelist: {:#}", e);
        }
        self.toxic_resync = true;
        if let Err(e) = self.sync_toxic().await {
            error!("Toxic list sync failed: {:#}", e);
        }
        if let Err(e) = self.check_bans(Utc::now()) {
            error!("Initial ban sync failed: {:#}", e);
        }
        Ok(())
    }

    pub async fn tick(&mut self) {
        self.poll_channel().await;

        let now = Utc::now();
        if let Err(e) = self.check_bans(now) {
            error!("Ban check failed: {:#}", e);
        }
        self.cull(now);

        if !self.token.sleep(self.settings.loop_interval).await {
            return;
        }

        if let Err(e) = self.sync_toxic().await {
            error!("Toxic list sync failed: {:#}", e);
        }
        match self.reload_whitelist() {
            Ok(true) => {
                // Re-derive both purposes so removals and additions take effect.
                self.toxic_resync = true;
                self.last_check = None;
            }
            Ok(false) => {}
            Err(e) => error!("Unable to reload whitelist: {:#}", e),
        }
    }

    async fn poll_channel(&mut self) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        match channel.poll(self.settings.channel_timeout).await {
            Ok(messages) => {
                // no commands are defined yet
                for message in messages {
                    debug!("Message received: {}", message);
                }
            }
            Err(e) => warn!("Channel read failed: {:#}", e),
        }
    }

    /// Re-read the whitelist file if it changed. Returns whether it did.
    fn reload_whitelist(&mut self) -> Result<bool> {
        if !self.whitelist.poll()? {
            return Ok(false);
        }
        let whitelist: Whitelist = self.whitelist.entries().iter().copied().collect();
        info!("Whitelist loaded: {} entries", whitelist.len());
        self.engine.set_whitelist(whitelist);
        Ok(true)
    }

    /// Fetch the feed when due, then fully sync the toxic chains if the list
    /// file changed or a sync was requested. Otherwise nothing is listed or
    /// mutated.
    async fn sync_toxic(&mut self) -> Result<()> {
        if let Some(feed) = self.feed.as_mut() {
            if self.next_fetch.map_or(true, |at| Instant::now() >= at) {
                match feed.fetch().await {
                    Ok(changed) => {
                        debug!("Toxic feed changed: {}", changed);
                        self.next_fetch = Some(Instant::now() + self.settings.toxic_refresh);
                    }
                    Err(e) => {
                        error!("Toxic feed fetch failed: {:#}", e);
                        self.next_fetch = Some(Instant::now() + FEED_RETRY_DELAY);
                    }
                }
            }
        }

        let changed = self.toxic.poll()?;
        if !changed && !self.toxic_resync {
            return Ok(());
        }

        let desired: BTreeSet<Address> = self.toxic.entries().iter().copied().collect();
        info!("Synchronizing {} toxic entries", desired.len());
        let report = self.engine.synchronize_full(Purpose::Toxic, &desired)?;
        info!("Toxic list synchronized: {}", report);
        self.toxic_resync = false;
        Ok(())
    }

    /// Ban candidates from the store and blacklist, allow candidates from
    /// the store. The first check (and any check after a list change) is a
    /// full sync; later ones are deltas since the previous success.
    fn check_bans(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.blacklist.poll() {
            Ok(true) if self.last_check.is_some() => {
                info!("Blacklist changed, resynchronizing bans");
                self.last_check = None;
            }
            Ok(_) => {}
            Err(e) => warn!("Unable to reload blacklist: {:#}", e),
        }
        let blacklist: BTreeSet<Address> = self.blacklist.entries().iter().copied().collect();

        if let Some(source) = self.ban_source.as_mut() {
            let released = source.addresses_to_allow(now, &self.settings.ttls)?;
            self.pending_allow.extend(released);
        }
        let allow: BTreeSet<Address> = self.pending_allow.difference(&blacklist).copied().collect();

        match self.last_check {
            None => {
                let mut desired = blacklist;
                if let Some(source) = self.ban_source.as_mut() {
                    desired.extend(source.addresses_to_ban(None, &self.settings.thresholds)?);
                }
                let desired: BTreeSet<Address> = desired.difference(&allow).copied().collect();
                let report = self.engine.synchronize_full(Purpose::Ban, &desired)?;
                info!("Bans synchronized: {}", report);
            }
            Some(since) => {
                let mut ban = blacklist;
                if let Some(source) = self.ban_source.as_mut() {
                    ban.extend(source.addresses_to_ban(Some(since), &self.settings.thresholds)?);
                }
                let report = self.engine.apply_delta(Purpose::Ban, &ban, &allow)?;
                if report.dropped > 0 || report.allowed > 0 {
                    info!("Bans updated: {}", report);
                }
            }
        }

        self.pending_allow.clear();
        self.last_check = Some(now);
        Ok(())
    }

    /// Drop idle records that never qualified, once per `cull_after`.
    fn cull(&mut self, now: DateTime<Utc>) {
        let Some(source) = self.ban_source.as_mut() else {
            return;
        };
        let Ok(cull_after) = chrono::Duration::from_std(self.settings.cull_after) else {
            return;
        };
        if self.last_cull.is_some_and(|at| now - at < cull_after) {
            return;
        }
        match source.cull(now - cull_after, &self.settings.thresholds) {
            Ok(culled) => {
                if culled > 0 {
                    info!("Culled {} idle complaint records", culled);
                }
                self.last_cull = Some(now);
            }
            Err(e) => error!("Complaint cull failed: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban_source::MockBanSource;
    use crate::config::Config;
    use crate::firewall::simulator::FakeIptables;
    use crate::firewall::Iptables;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn set(list: &[&str]) -> BTreeSet<Address> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn settings() -> DaemonSettings {
        let mut settings = Config::default().daemon_settings().unwrap();
        settings.loop_interval = Duration::from_millis(1);
        settings.channel_timeout = Duration::from_millis(1);
        settings
    }

    fn paths(dir: &TempDir) -> ListPaths {
        ListPaths {
            whitelist: dir.path().join("whitelist"),
            blacklist: dir.path().join("blacklist"),
            toxic: dir.path().join("toxic_ip"),
        }
    }

    fn daemon<'a>(fake: &'a FakeIptables, dir: &TempDir) -> Daemon<&'a FakeIptables> {
        let engine = SyncEngine::new(Iptables::new(fake, "iptables"), Whitelist::new());
        Daemon::new(engine, settings(), paths(dir), ShutdownToken::new())
    }

    /// Writes scripted content to the toxic path on each fetch.
    struct ScriptedFeed {
        path: PathBuf,
        bodies: Arc<Mutex<Vec<Option<String>>>>,
        calls: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl FeedSource for ScriptedFeed {
        async fn fetch(&mut self) -> Result<bool> {
            *self.calls.lock().unwrap() += 1;
            let next = self.bodies.lock().unwrap().pop();
            match next {
                Some(Some(body)) => {
                    std::fs::write(&self.path, body)?;
                    Ok(true)
                }
                Some(None) | None => Ok(false),
            }
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    fn quiet_source() -> MockBanSource {
        let mut source = MockBanSource::new();
        source
            .expect_addresses_to_allow()
            .returning(|_, _| Ok(BTreeSet::new()));
        source
            .expect_addresses_to_ban()
            .returning(|_, _| Ok(BTreeSet::new()));
        source.expect_cull().returning(|_, _| Ok(0));
        source
    }

    #[tokio::test]
    async fn test_start_builds_topology_and_initial_state() {
        let dir = TempDir::new().unwrap();
        let p = paths(&dir);
        std::fs::write(&p.toxic, "# feed\n5.5.5.5\n6.6.6.0/24\n").unwrap();
        std::fs::write(&p.blacklist, "7.7.7.7\n").unwrap();
        std::fs::write(&p.whitelist, "8.8.8.8\n").unwrap();

        let mut source = MockBanSource::new();
        source
            .expect_addresses_to_allow()
            .times(1)
            .returning(|_, _| Ok(BTreeSet::new()));
        source
            .expect_addresses_to_ban()
            .withf(|since, _| since.is_none())
            .times(1)
            .returning(|_, _| Ok(set(&["1.2.3.4", "8.8.8.8"])));

        let fake = FakeIptables::new();
        let mut daemon = daemon(&fake, &dir).with_ban_source(Box::new(source));
        daemon.start().await.unwrap();

        assert_eq!(fake.addresses("chainban-toxic-input"), vec!["5.5.5.5", "6.6.6.0/24"]);
        assert_eq!(fake.addresses("chainban-toxic-output"), vec!["5.5.5.5", "6.6.6.0/24"]);
        assert_eq!(fake.addresses("chainban-input"), vec!["1.2.3.4", "7.7.7.7"]);
        assert!(daemon.last_check().is_some());
        assert!(fake.mutations().iter().all(|m| !m.contains("8.8.8.8")));
    }

    #[tokio::test]
    async fn test_start_fails_when_topology_fails() {
        let dir = TempDir::new().unwrap();
        let fake = FakeIptables::new();
        fake.fail_on("-N");
        let mut daemon = daemon(&fake, &dir);
        assert!(daemon.start().await.is_err());
    }

    #[tokio::test]
    async fn test_tick_applies_delta_with_allow_precedence() {
        let dir = TempDir::new().unwrap();
        let fake = FakeIptables::with_topology();
        fake.push_drop("chainban-input", "3.3.3.3", false);
        fake.push_drop("chainban-output", "3.3.3.3", true);

        let mut source = MockBanSource::new();
        let mut seq = mockall::Sequence::new();
        // start: full sync keeps 3.3.3.3
        source
            .expect_addresses_to_allow()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(BTreeSet::new()));
        source
            .expect_addresses_to_ban()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(set(&["3.3.3.3"])));
        // tick: 3.3.3.3 expires while 4.4.4.4 and 3.3.3.3 are reported
        source
            .expect_addresses_to_allow()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(set(&["3.3.3.3"])));
        source
            .expect_addresses_to_ban()
            .withf(|since, _| since.is_some())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(set(&["3.3.3.3", "4.4.4.4"])));
        source.expect_cull().returning(|_, _| Ok(0));

        let mut daemon = daemon(&fake, &dir).with_ban_source(Box::new(source));
        daemon.start().await.unwrap();
        let first = daemon.last_check();
        daemon.tick().await;

        assert_eq!(fake.addresses("chainban-input"), vec!["4.4.4.4"]);
        assert_eq!(fake.addresses("chainban-output"), vec!["4.4.4.4"]);
        assert!(daemon.last_check() >= first);
    }

    #[tokio::test]
    async fn test_failed_check_keeps_pending_allow() {
        let dir = TempDir::new().unwrap();
        let fake = FakeIptables::with_topology();
        fake.push_drop("chainban-input", "9.9.9.9", false);

        let mut source = MockBanSource::new();
        let mut first = true;
        source.expect_addresses_to_allow().returning(move |_, _| {
            if std::mem::take(&mut first) {
                Ok(set(&["9.9.9.9"]))
            } else {
                Ok(BTreeSet::new())
            }
        });
        source
            .expect_addresses_to_ban()
            .returning(|_, _| Ok(BTreeSet::new()));

        let mut daemon = daemon(&fake, &dir).with_ban_source(Box::new(source));
        let since = Utc::now();
        daemon.last_check = Some(since);

        fake.fail_on("--list");
        assert!(daemon.check_bans(Utc::now()).is_err());
        assert_eq!(daemon.last_check(), Some(since));

        // The store already forgot 9.9.9.9; the retry must still release it.
        fake.clear_failure();
        daemon.check_bans(Utc::now()).unwrap();
        assert!(fake.addresses("chainban-input").is_empty());
        assert!(daemon.last_check() >= Some(since));
    }

    #[tokio::test]
    async fn test_unchanged_toxic_feed_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let p = paths(&dir);
        let fake = FakeIptables::with_topology();
        let calls = Arc::new(Mutex::new(0));
        let feed = ScriptedFeed {
            path: p.toxic.clone(),
            // popped from the end: first fetch writes, later ones are unchanged
            bodies: Arc::new(Mutex::new(vec![None, Some("1.1.1.1\n".to_string())])),
            calls: calls.clone(),
        };

        let mut daemon = daemon(&fake, &dir)
            .with_ban_source(Box::new(quiet_source()))
            .with_feed(Box::new(feed));
        daemon.start().await.unwrap();
        assert_eq!(fake.addresses("chainban-toxic-input"), vec!["1.1.1.1"]);

        // Force the feed due again; it reports unchanged.
        daemon.next_fetch = Some(Instant::now());
        let listings = fake.listings();
        fake.clear_mutations();
        daemon.sync_toxic().await.unwrap();

        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(fake.listings(), listings);
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_whitelist_change_resyncs_toxic_without_download() {
        let dir = TempDir::new().unwrap();
        let p = paths(&dir);
        let fake = FakeIptables::with_topology();
        let calls = Arc::new(Mutex::new(0));
        let feed = ScriptedFeed {
            path: p.toxic.clone(),
            bodies: Arc::new(Mutex::new(vec![Some("1.1.1.1\n2.2.2.2\n".to_string())])),
            calls: calls.clone(),
        };

        let mut daemon = daemon(&fake, &dir)
            .with_ban_source(Box::new(quiet_source()))
            .with_feed(Box::new(feed));
        daemon.start().await.unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(
            fake.addresses("chainban-toxic-input"),
            vec!["1.1.1.1", "2.2.2.2"]
        );

        std::fs::write(&p.whitelist, "1.1.1.1\n").unwrap();
        daemon.tick().await;
        assert!(daemon.toxic_resync);
        daemon.tick().await;

        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(!daemon.toxic_resync);
        assert_eq!(fake.addresses("chainban-toxic-input"), vec!["2.2.2.2"]);
        assert_eq!(fake.addresses("chainban-toxic-output"), vec!["2.2.2.2"]);
    }

    #[tokio::test]
    async fn test_whitelist_change_resyncs() {
        let dir = TempDir::new().unwrap();
        let p = paths(&dir);
        std::fs::write(&p.blacklist, "10.0.0.5\n8.8.4.4\n").unwrap();
        let fake = FakeIptables::with_topology();

        let mut daemon = daemon(&fake, &dir);
        daemon.start().await.unwrap();
        assert_eq!(fake.addresses("chainban-input"), vec!["8.8.4.4", "10.0.0.5"]);

        std::fs::write(&p.whitelist, "10.0.0.0/8\n").unwrap();
        daemon.tick().await;
        // whitelist picked up at the end of the tick; the next tick resyncs
        daemon.tick().await;

        assert_eq!(fake.addresses("chainban-input"), vec!["8.8.4.4"]);
        assert_eq!(fake.addresses("chainban-output"), vec!["8.8.4.4"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let fake = FakeIptables::with_topology();
        let token = ShutdownToken::new();
        let engine = SyncEngine::new(Iptables::new(&fake, "iptables"), Whitelist::new());
        let mut daemon = Daemon::new(engine, settings(), paths(&dir), token.clone());

        token.cancel();
        daemon.run().await.unwrap();
        assert!(daemon.last_check().is_some());
    }
}
