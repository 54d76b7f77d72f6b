//! Configuration management for chainban.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ban_source::Severity;
use crate::error::ChainbanError;
use crate::validation::{parse_interval, validate_feed_url, validate_interval};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/chainban/config.yaml";

/// Default toxic feed: StopForumSpam's CIDR list.
pub const DEFAULT_TOXIC_URL: &str = "http://www.stopforumspam.com/downloads/toxic_ip_cidr.txt";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// iptables binary; searched on PATH and the sbin directories when unset
    pub iptables_path: Option<PathBuf>,

    /// Pause between daemon ticks (e.g. "1s")
    pub loop_interval: String,

    pub channel: ChannelConfig,

    pub toxic: ToxicConfig,

    /// Addresses and networks never blocked
    pub whitelist_path: PathBuf,

    /// Addresses always blocked
    pub blacklist_path: PathBuf,

    pub store: StoreConfig,

    /// Minimum complaint count per severity before an address is banned
    pub thresholds: Thresholds,

    /// How long a ban lasts per severity after the last complaint
    pub ttls: Ttls,

    /// Single-instance lock file
    pub lock_path: PathBuf,

    /// Log at debug level
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iptables_path: None,
            loop_interval: "1s".to_string(),
            channel: ChannelConfig::default(),
            toxic: ToxicConfig::default(),
            whitelist_path: PathBuf::from("/etc/chainban/whitelist"),
            blacklist_path: PathBuf::from("/etc/chainban/blacklist"),
            store: StoreConfig::default(),
            thresholds: Thresholds::default(),
            ttls: Ttls::default(),
            lock_path: PathBuf::from("/var/run/chainban.lock"),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub path: PathBuf,
    /// Longest wait for a message each tick
    pub timeout: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/var/run/chainban.fifo"),
            timeout: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToxicConfig {
    /// Feed URL; empty means the toxic file is maintained locally
    pub url: String,
    pub path: PathBuf,
    pub refresh_interval: String,
}

impl Default for ToxicConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_TOXIC_URL.to_string(),
            path: PathBuf::from("/etc/chainban/toxic_ip"),
            refresh_interval: "1d".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub enabled: bool,
    pub path: PathBuf,
    /// Idle records below every threshold are dropped after this long
    pub cull_after: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/var/lib/chainban/complaints.json"),
            cull_after: "1d".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Thresholds {
    pub known: u32,
    pub hacking: u32,
    pub suspicious: u32,
    pub notice: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            known: 1,
            hacking: 2,
            suspicious: 3,
            notice: 3,
        }
    }
}

impl Thresholds {
    pub fn by_severity(&self) -> BTreeMap<Severity, u32> {
        BTreeMap::from([
            (Severity::Known, self.known),
            (Severity::Hacking, self.hacking),
            (Severity::Suspicious, self.suspicious),
            (Severity::Notice, self.notice),
        ])
    }
}

/// Severity `known` has no TTL and is never released.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Ttls {
    pub hacking: String,
    pub suspicious: String,
    pub notice: String,
}

impl Default for Ttls {
    fn default() -> Self {
        Self {
            hacking: "7d".to_string(),
            suspicious: "1d".to_string(),
            notice: "8h".to_string(),
        }
    }
}

impl Ttls {
    pub fn by_severity(&self) -> Result<BTreeMap<Severity, Duration>> {
        Ok(BTreeMap::from([
            (Severity::Hacking, parse_interval(&self.hacking)?),
            (Severity::Suspicious, parse_interval(&self.suspicious)?),
            (Severity::Notice, parse_interval(&self.notice)?),
        ]))
    }
}

/// Resolved durations and maps the daemon works with.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonSettings {
    pub loop_interval: Duration,
    pub channel_timeout: Duration,
    pub toxic_refresh: Duration,
    pub cull_after: Duration,
    pub thresholds: BTreeMap<Severity, u32>,
    pub ttls: BTreeMap<Severity, Duration>,
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load `path` if it exists, otherwise use the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("loop_interval", &self.loop_interval),
            ("channel.timeout", &self.channel.timeout),
            ("toxic.refresh_interval", &self.toxic.refresh_interval),
            ("store.cull_after", &self.store.cull_after),
            ("ttls.hacking", &self.ttls.hacking),
            ("ttls.suspicious", &self.ttls.suspicious),
            ("ttls.notice", &self.ttls.notice),
        ];
        for (name, value) in intervals {
            validate_interval(value).map_err(|e| {
                ChainbanError::Configuration(format!("Invalid {} '{}': {}", name, value, e))
            })?;
        }

        if !self.toxic.url.is_empty() {
            validate_feed_url(&self.toxic.url).map_err(|e| {
                ChainbanError::Configuration(format!("Invalid toxic.url '{}': {}", self.toxic.url, e))
            })?;
        }

        for (severity, min) in self.thresholds.by_severity() {
            if min == 0 {
                return Err(ChainbanError::Configuration(format!(
                    "thresholds.{} must be at least 1",
                    severity
                ))
                .into());
            }
        }

        Ok(())
    }

    /// Resolve interval strings. Call after [`Config::validate`].
    pub fn daemon_settings(&self) -> Result<DaemonSettings> {
        Ok(DaemonSettings {
            loop_interval: parse_interval(&self.loop_interval)?,
            channel_timeout: parse_interval(&self.channel.timeout)?,
            toxic_refresh: parse_interval(&self.toxic.refresh_interval)?,
            cull_after: parse_interval(&self.store.cull_after)?,
            thresholds: self.thresholds.by_severity(),
            ttls: self.ttls.by_severity()?,
        })
    }

    /// Save configuration to YAML file atomically
    ///
    /// Uses tempfile + rename pattern to prevent corruption on crash.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let path = path.as_ref();
        let content = serde_yaml::to_string(self).with_context(|| "Failed to serialize config")?;

        let parent_dir = path.parent().unwrap_or(Path::new("/etc/chainban"));
        std::fs::create_dir_all(parent_dir)
            .with_context(|| format!("Failed to create {:?}", parent_dir))?;
        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .context("Failed to create temporary file for config")?;

        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;

        temp_file
            .persist(path)
            .with_context(|| format!("Failed to persist config file: {:?}", path))?;

        Ok(())
    }
}
