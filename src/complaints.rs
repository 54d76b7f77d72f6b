//! JSON-file complaint store, the concrete [`BanSource`].
//!
//! One record per address. Every access takes a blocking lock on a sidecar
//! `.lock` file so `chainban complain` can write while the daemon reads, and
//! every write goes through a temp file and rename.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::address::Address;
use crate::ban_source::{BanSource, Severity};
use crate::error::ChainbanError;
use crate::lock::LockGuard;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Complaint {
    pub address: Address,
    pub severity: Severity,
    pub complaints: u32,
    pub created: DateTime<Utc>,
    /// Last time a complaint was lodged.
    pub recent: DateTime<Utc>,
}

impl Complaint {
    fn reaches(&self, thresholds: &BTreeMap<Severity, u32>) -> bool {
        thresholds
            .get(&self.severity)
            .is_some_and(|min| self.complaints >= *min)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    records: Vec<Complaint>,
}

type Records = BTreeMap<Address, Complaint>;

#[derive(Debug, Clone)]
pub struct ComplaintStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ComplaintStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Records> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Records::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read complaint store {:?}", self.path))
            }
        };

        let file: StoreFile = serde_json::from_str(&content).map_err(|e| {
            ChainbanError::Store(format!("{} is not a valid store: {}", self.path.display(), e))
        })?;
        Ok(file
            .records
            .into_iter()
            .map(|record| (record.address, record))
            .collect())
    }

    fn save(&self, records: &Records) -> Result<()> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;

        let file = StoreFile {
            records: records.values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&file).context("Failed to serialize store")?;

        let mut temp = NamedTempFile::new_in(parent)
            .context("Failed to create temporary file for complaint store")?;
        temp.write_all(content.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .with_context(|| format!("Failed to persist complaint store {:?}", self.path))?;
        Ok(())
    }

    /// Run `f` against the records under the lock, saving only if it changed them.
    fn update<T>(&self, f: impl FnOnce(&mut Records) -> T) -> Result<T> {
        let _lock = LockGuard::wait(&self.lock_path)?;
        let mut records = self.load()?;
        let before = records.clone();
        let out = f(&mut records);
        if records != before {
            self.save(&records)?;
        }
        Ok(out)
    }

    /// Every record, ordered by address.
    pub fn records(&self) -> Result<Vec<Complaint>> {
        let _lock = LockGuard::wait(&self.lock_path)?;
        Ok(self.load()?.into_values().collect())
    }

    pub fn get(&self, address: &Address) -> Result<Option<Complaint>> {
        let _lock = LockGuard::wait(&self.lock_path)?;
        Ok(self.load()?.remove(address))
    }

    pub fn complain(&self, address: Address, severity: Severity, count: u32) -> Result<u32> {
        self.complain_at(address, severity, count, Utc::now())
    }

    /// Add `count` complaints against `address`. The record keeps the most
    /// severe level it has seen. Returns the new complaint total.
    pub fn complain_at(
        &self,
        address: Address,
        severity: Severity,
        count: u32,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let total = self.update(|records| {
            let record = records.entry(address).or_insert_with(|| Complaint {
                address,
                severity,
                complaints: 0,
                created: now,
                recent: now,
            });
            record.complaints = record.complaints.saturating_add(count);
            record.severity = record.severity.min(severity);
            record.recent = now;
            record.complaints
        })?;
        debug!("Complaint against {} ({}): {} total", address, severity, total);
        Ok(total)
    }
}

impl BanSource for ComplaintStore {
    fn addresses_to_ban(
        &mut self,
        since: Option<DateTime<Utc>>,
        thresholds: &BTreeMap<Severity, u32>,
    ) -> Result<BTreeSet<Address>> {
        let _lock = LockGuard::wait(&self.lock_path)?;
        Ok(self
            .load()?
            .values()
            .filter(|record| since.map_or(true, |since| record.recent >= since))
            .filter(|record| record.reaches(thresholds))
            .map(|record| record.address)
            .collect())
    }

    fn addresses_to_allow(
        &mut self,
        now: DateTime<Utc>,
        ttls: &BTreeMap<Severity, Duration>,
    ) -> Result<BTreeSet<Address>> {
        let mut cutoffs = BTreeMap::new();
        for (severity, ttl) in ttls {
            let ttl = chrono::Duration::from_std(*ttl)
                .with_context(|| format!("TTL for {} out of range", severity))?;
            cutoffs.insert(*severity, now - ttl);
        }

        let expired = self.update(|records| {
            let expired: BTreeSet<Address> = records
                .values()
                .filter(|record| {
                    cutoffs
                        .get(&record.severity)
                        .is_some_and(|cutoff| record.recent < *cutoff)
                })
                .map(|record| record.address)
                .collect();
            records.retain(|addr, _| !expired.contains(addr));
            expired
        })?;

        if !expired.is_empty() {
            info!("{} complaint records expired", expired.len());
        }
        Ok(expired)
    }

    fn cull(&mut self, cutoff: DateTime<Utc>, thresholds: &BTreeMap<Severity, u32>) -> Result<usize> {
        let culled = self.update(|records| {
            let before = records.len();
            records.retain(|_, record| record.recent >= cutoff || record.reaches(thresholds));
            before - records.len()
        })?;
        if culled > 0 {
            debug!("Culled {} idle complaint records", culled);
        }
        Ok(culled)
    }
}
