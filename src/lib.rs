//! Blackhole DNS daemon.
//!
//! Forwards DNS queries from allowed clients to a recursive resolver, and
//! answers queries for known ad and tracker domains with 0.0.0.0 instead.
//! Clients are gated by an address prefix allow-list and a per-IP rate
//! limit before any query is resolved.

pub mod allowlist;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod dns;
pub mod error;
pub mod filter;
pub mod http;
pub mod ratelimit;
pub mod resolver;
pub mod stats;
pub mod transport;
pub mod upstream;

pub use config::DaemonConfig;
pub use daemon::{Daemon, Listeners};
pub use error::{Error, Result};
