//! Error types for the daemon.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for daemon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running the daemon
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration, the daemon refuses to start
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error from a listener or socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Dialing the upstream forwarder failed
    #[error("failed to connect to forwarder {addr}: {source}")]
    Forwarder {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// HTTP request failed or returned a non-2xx status
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A blacklist source returned too few entries to be trusted
    #[error("{list} list is suspiciously short at only {count} entries")]
    ShortList { list: String, count: usize },

    /// Every blacklist source failed, the previous snapshot is kept
    #[error("none of the {0} blacklist sources could be retrieved")]
    BlacklistUnavailable(usize),

    /// The public IP service answered with something that is not an address
    #[error("public IP service returned an invalid address: {0:?}")]
    InvalidPublicIp(String),
}
