//! Error types for chainban.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainbanError {
    /// Fatal at startup: missing tool, bad feed URL, unusable config.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    /// A firewall tool invocation exited non-zero.
    #[error("{program} failed (exit {}): {}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()), stderr.trim())]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Feed error: {0}")]
    Feed(String),

    #[error("Complaint store error: {0}")]
    Store(String),
}
