//! One-entry-per-line address list files (whitelist, blacklist, toxic list).
//!
//! Format: one IPv4 address or CIDR network per line, `#` comments (whole
//! line or trailing) stripped, blank lines ignored, `/32` treated as a host.
//! Invalid entries are dropped with a notice and never abort the load.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

use crate::address::Address;

/// Parse list file content into addresses, in file order, without duplicates.
pub fn parse_ip_list(content: &str, label: &str) -> Vec<Address> {
    let mut seen = std::collections::HashSet::new();
    content
        .lines()
        .filter_map(|line| {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<Address>() {
                Ok(addr) if addr.is_any() => {
                    debug!("Removed {} from {} - matches every address", trimmed, label);
                    None
                }
                Ok(addr) => Some(addr),
                Err(_) => {
                    debug!("Removed {} from {} - not a valid address", trimmed, label);
                    None
                }
            }
        })
        .filter(|addr| seen.insert(*addr))
        .collect()
}

/// Load a list file. A missing file is an empty list.
pub fn load_ip_file(path: &Path, label: &str) -> Result<Vec<Address>> {
    info!("Loading {} file: {}", label, path.display());
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(parse_ip_list(&content, label)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {} file {:?}", label, path)),
    }
}

/// A list file that is re-read only when its modification time changes.
#[derive(Debug)]
pub struct WatchedList {
    path: PathBuf,
    label: &'static str,
    mtime: Option<SystemTime>,
    entries: Vec<Address>,
}

impl WatchedList {
    pub fn new(path: impl Into<PathBuf>, label: &'static str) -> Self {
        Self {
            path: path.into(),
            label,
            mtime: None,
            entries: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[Address] {
        &self.entries
    }

    /// Re-read the file if its modification time changed since the last poll.
    ///
    /// Returns `true` when the entries changed (including the file vanishing).
    pub fn poll(&mut self) -> Result<bool> {
        let mtime = match std::fs::metadata(&self.path) {
            Ok(meta) => meta
                .modified()
                .with_context(|| format!("No modification time for {:?}", self.path))?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.mtime.take().is_some() {
                    info!("{} file {} removed", self.label, self.path.display());
                    self.entries.clear();
                    return Ok(true);
                }
                return Ok(false);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {:?}", self.path));
            }
        };

        if self.mtime == Some(mtime) {
            return Ok(false);
        }

        self.entries = load_ip_file(&self.path, self.label)?;
        self.mtime = Some(mtime);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn strs(list: &[Address]) -> Vec<String> {
        list.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_parse_ip_list_mixed() {
        let content = "# toxic list\n\n1.2.3.4\n10.0.0.0/8\n5.6.7.8/32\n  9.9.9.9  # trailing\n";
        let list = parse_ip_list(content, "toxic");
        assert_eq!(strs(&list), vec!["1.2.3.4", "10.0.0.0/8", "5.6.7.8", "9.9.9.9"]);
    }

    #[test]
    fn test_parse_ip_list_drops_invalid() {
        let content = "1.2.3.4\nnot-an-ip\n300.1.1.1\n::1\n10.0.0.1\n";
        let list = parse_ip_list(content, "whitelist");
        assert_eq!(strs(&list), vec!["1.2.3.4", "10.0.0.1"]);
    }

    #[test]
    fn test_parse_ip_list_drops_match_all() {
        let content = "0.0.0.0/0
1.2.3.4/0
0.0.0.0/8
8.8.8.8
";
        let list = parse_ip_list(content, "toxic");
        assert_eq!(strs(&list), vec!["0.0.0.0/8", "8.8.8.8"]);
    }

    #[test]
    fn test_parse_ip_list_deduplicates() {
        let list = parse_ip_list("1.2.3.4\n1.2.3.4/32\n1.2.3.4\n", "blacklist");
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let list = load_ip_file(Path::new("/nonexistent/chainban/whitelist"), "whitelist").unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_watched_list_rereads_only_on_mtime_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("whitelist");
        std::fs::write(&path, "10.0.0.5\n").unwrap();

        let mut watched = WatchedList::new(&path, "whitelist");
        assert!(watched.poll().unwrap());
        assert_eq!(strs(watched.entries()), vec!["10.0.0.5"]);

        // Unchanged mtime: no reload even if content is rewritten in place with the
        // original timestamp restored.
        let original = std::fs::metadata(&path).unwrap().modified().unwrap();
        std::fs::write(&path, "10.0.0.6\n").unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(original)
            .unwrap();
        assert!(!watched.poll().unwrap());
        assert_eq!(strs(watched.entries()), vec!["10.0.0.5"]);

        // Newer mtime: reload.
        let mut file = File::options().append(true).open(&path).unwrap();
        writeln!(file, "192.168.0.0/16").unwrap();
        file.set_modified(original + Duration::from_secs(10)).unwrap();
        assert!(watched.poll().unwrap());
        assert_eq!(strs(watched.entries()), vec!["10.0.0.6", "192.168.0.0/16"]);
    }

    #[test]
    fn test_watched_list_missing_then_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blacklist");

        let mut watched = WatchedList::new(&path, "blacklist");
        assert!(!watched.poll().unwrap());
        assert!(watched.entries().is_empty());

        std::fs::write(&path, "1.1.1.1\n").unwrap();
        assert!(watched.poll().unwrap());
        assert_eq!(watched.entries().len(), 1);

        std::fs::remove_file(&path).unwrap();
        assert!(watched.poll().unwrap());
        assert!(watched.entries().is_empty());
        assert!(!watched.poll().unwrap());
    }
}
