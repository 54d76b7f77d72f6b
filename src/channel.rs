//! Named-pipe message channel polled once per tick.
//!
//! Other processes write newline-terminated messages into the FIFO. The
//! daemon currently only logs them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::{debug, warn};

use crate::error::ChainbanError;

/// Longest partial line kept between polls.
const MAX_PENDING: usize = 64 * 1024;

#[async_trait]
pub trait MessageChannel: Send {
    /// Wait at most `timeout` for input and return the complete lines read.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<String>>;
}

pub struct FifoChannel {
    path: PathBuf,
    receiver: pipe::Receiver,
    pending: Vec<u8>,
}

/// Create `path` as a world-writable FIFO unless a FIFO is already there.
fn ensure_fifo(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(_) => {
            return Err(ChainbanError::Configuration(format!(
                "{} exists and is not a FIFO",
                path.display()
            ))
            .into())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {:?}", path)),
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
    }

    let c_path = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("Invalid FIFO path {:?}", path))?;
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("mkfifo {:?} failed", path));
    }

    // mkfifo honours the umask
    fs::set_permissions(path, fs::Permissions::from_mode(0o666))
        .with_context(|| format!("Failed to chmod {:?}", path))?;
    Ok(())
}

impl FifoChannel {
    /// Create the FIFO if needed and open it. Must be called inside a tokio
    /// runtime.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        ensure_fifo(&path)?;

        // Read-write so the pipe never reports EOF when the last writer leaves.
        let receiver = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&path)
            .with_context(|| format!("Failed to open FIFO {:?}", path))?;

        debug!("Listening on {}", path.display());
        Ok(Self {
            path,
            receiver,
            pending: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn take_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        if self.pending.len() > MAX_PENDING {
            warn!(
                "Discarding {} bytes without newline from {}",
                self.pending.len(),
                self.path.display()
            );
            self.pending.clear();
        }
        lines
    }
}

#[async_trait]
impl MessageChannel for FifoChannel {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<String>> {
        let mut chunk = [0u8; 4096];
        match tokio::time::timeout(timeout, self.receiver.read(&mut chunk)).await {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(n)) => {
                self.pending.extend_from_slice(&chunk[..n]);
                Ok(self.take_lines())
            }
            Ok(Err(e)) => Err(e).with_context(|| format!("Failed to read FIFO {:?}", self.path)),
        }
    }
}
