//! Daemon configuration.
//!
//! Loaded from a JSON file or assembled from command line flags, then
//! validated once before anything is bound or dialed.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filter::BlacklistSource;

/// Divisor turning the per-IP limit into the number of dispatch shards.
///
/// Shards exist to keep one busy client from stalling unrelated ones, so
/// their count scales with how many queries a single client may have in
/// flight rather than with CPU count.
pub const QUEUE_RATIO: u32 = 10;

/// Smallest accepted per-IP limit; yields one shard.
pub const MIN_PER_IP_LIMIT: u32 = QUEUE_RATIO;

/// Depth of each forward queue.
pub const FORWARD_QUEUE_DEPTH: usize = 16;

/// Depth of each blackhole queue. Blackhole answers are cheap to produce.
pub const BLACKHOLE_QUEUE_DEPTH: usize = 4;

/// Default public IP lookup service, answers with the caller's address.
pub const DEFAULT_PUBLIC_IP_URL: &str = "https://api.ipify.org";

/// Configuration of the DNS daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Address both listeners bind to, e.g. 0.0.0.0 for all interfaces
    pub address: IpAddr,
    /// UDP listen port, 0 disables the UDP listener
    #[serde(default)]
    pub udp_port: u16,
    /// TCP listen port, 0 disables the TCP listener
    #[serde(default)]
    pub tcp_port: u16,
    /// Forward UDP queries to this resolver
    #[serde(default)]
    pub udp_forwarder: Option<SocketAddr>,
    /// Forward TCP queries to this resolver
    #[serde(default)]
    pub tcp_forwarder: Option<SocketAddr>,
    /// Queries an IP may send per rate limit window
    pub per_ip_limit: u32,
    /// Only clients whose address starts with one of these may query
    pub allow_query_ip_prefixes: Vec<String>,
    /// Deadline for every upstream read and write
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    /// Length of the rate limit window
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    /// How often the ad-blacklist is downloaded again
    #[serde(default = "default_blacklist_refresh_secs")]
    pub blacklist_refresh_secs: u64,
    /// How often this host's public IP is looked up and allowed
    #[serde(default = "default_public_ip_refresh_secs")]
    pub public_ip_refresh_secs: u64,
    /// Public IP lookup service, `None` disables the lookup
    #[serde(default = "default_public_ip_url")]
    pub public_ip_url: Option<String>,
    /// Remote ad-server lists
    #[serde(default = "BlacklistSource::defaults")]
    pub blacklist_sources: Vec<BlacklistSource>,
}

fn default_io_timeout_secs() -> u64 {
    120
}

fn default_rate_limit_window_secs() -> u64 {
    10
}

fn default_blacklist_refresh_secs() -> u64 {
    7200
}

fn default_public_ip_refresh_secs() -> u64 {
    1800
}

fn default_public_ip_url() -> Option<String> {
    Some(DEFAULT_PUBLIC_IP_URL.to_string())
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port: 53,
            tcp_port: 53,
            udp_forwarder: None,
            tcp_forwarder: None,
            per_ip_limit: 50,
            allow_query_ip_prefixes: Vec::new(),
            io_timeout_secs: default_io_timeout_secs(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            blacklist_refresh_secs: default_blacklist_refresh_secs(),
            public_ip_refresh_secs: default_public_ip_refresh_secs(),
            public_ip_url: default_public_ip_url(),
            blacklist_sources: BlacklistSource::defaults(),
        }
    }
}

impl DaemonConfig {
    /// Read a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid config file {}: {e}", path.display())))
    }

    /// Check that the daemon can usefully run with this configuration.
    pub fn validate(&self) -> Result<()> {
        if self.udp_port == 0 && self.tcp_port == 0 {
            return Err(Error::Config(
                "at least one of UDP and TCP listen port must be set".into(),
            ));
        }
        if self.udp_port != 0 && self.udp_forwarder.is_none() {
            return Err(Error::Config(
                "UDP listener requires a UDP forwarder address".into(),
            ));
        }
        if self.tcp_port != 0 && self.tcp_forwarder.is_none() {
            return Err(Error::Config(
                "TCP listener requires a TCP forwarder address".into(),
            ));
        }
        if self.per_ip_limit < MIN_PER_IP_LIMIT {
            return Err(Error::Config(format!(
                "per IP limit must be at least {MIN_PER_IP_LIMIT}, got {}",
                self.per_ip_limit
            )));
        }
        if self.allow_query_ip_prefixes.is_empty() {
            return Err(Error::Config(
                "allowable IP prefixes list must not be empty".into(),
            ));
        }
        if self.allow_query_ip_prefixes.iter().any(|p| p.is_empty()) {
            return Err(Error::Config(
                "allowable IP prefixes must not be empty strings".into(),
            ));
        }
        if self.io_timeout_secs == 0
            || self.rate_limit_window_secs == 0
            || self.blacklist_refresh_secs == 0
            || self.public_ip_refresh_secs == 0
        {
            return Err(Error::Config("timeouts and intervals must be positive".into()));
        }
        Ok(())
    }

    /// Number of forward shards, and of blackhole shards.
    pub fn shard_count(&self) -> usize {
        (self.per_ip_limit / QUEUE_RATIO).max(1) as usize
    }

    pub fn udp_bind_addr(&self) -> Option<SocketAddr> {
        (self.udp_port != 0).then(|| SocketAddr::new(self.address, self.udp_port))
    }

    pub fn tcp_bind_addr(&self) -> Option<SocketAddr> {
        (self.tcp_port != 0).then(|| SocketAddr::new(self.address, self.tcp_port))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn blacklist_refresh(&self) -> Duration {
        Duration::from_secs(self.blacklist_refresh_secs)
    }

    pub fn public_ip_refresh(&self) -> Duration {
        Duration::from_secs(self.public_ip_refresh_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> DaemonConfig {
        DaemonConfig {
            udp_forwarder: Some("8.8.8.8:53".parse().unwrap()),
            tcp_forwarder: Some("8.8.4.4:53".parse().unwrap()),
            allow_query_ip_prefixes: vec!["192.168.".to_string()],
            ..DaemonConfig::default()
        }
    }

    #[test]
    fn default_with_forwarders_and_prefixes_is_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_low_per_ip_limit() {
        let config = DaemonConfig {
            per_ip_limit: 9,
            ..valid()
        };

        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_empty_prefix_list_and_empty_prefixes() {
        let empty = DaemonConfig {
            allow_query_ip_prefixes: Vec::new(),
            ..valid()
        };
        let blank = DaemonConfig {
            allow_query_ip_prefixes: vec!["10.".to_string(), String::new()],
            ..valid()
        };

        assert!(empty.validate().is_err());
        assert!(blank.validate().is_err());
    }

    #[test]
    fn rejects_no_listeners() {
        let config = DaemonConfig {
            udp_port: 0,
            tcp_port: 0,
            ..valid()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_listener_without_forwarder() {
        let config = DaemonConfig {
            tcp_forwarder: None,
            ..valid()
        };
        let tcp_only = DaemonConfig {
            udp_port: 0,
            udp_forwarder: None,
            ..valid()
        };

        assert!(config.validate().is_err());
        assert!(tcp_only.validate().is_ok());
    }

    #[test]
    fn shard_count_follows_queue_ratio() {
        let shards = |per_ip_limit| DaemonConfig { per_ip_limit, ..valid() }.shard_count();

        assert_eq!(shards(10), 1);
        assert_eq!(shards(19), 1);
        assert_eq!(shards(50), 5);
        assert_eq!(shards(100), 10);
    }

    #[test]
    fn parses_minimal_json_with_defaults() {
        let json = r#"{
            "address": "127.0.0.1",
            "udp_port": 5353,
            "udp_forwarder": "1.1.1.1:53",
            "per_ip_limit": 30,
            "allow_query_ip_prefixes": ["127.", "192.168.1."]
        }"#;

        let config: DaemonConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.tcp_port, 0);
        assert_eq!(config.io_timeout(), Duration::from_secs(120));
        assert_eq!(config.rate_limit_window(), Duration::from_secs(10));
        assert_eq!(config.blacklist_sources, BlacklistSource::defaults());
        assert_eq!(config.public_ip_url.as_deref(), Some(DEFAULT_PUBLIC_IP_URL));
        assert_eq!(config.udp_bind_addr(), Some("127.0.0.1:5353".parse().unwrap()));
        assert_eq!(config.tcp_bind_addr(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn explicit_null_disables_public_ip_lookup() {
        let json = r#"{
            "address": "0.0.0.0",
            "tcp_port": 53,
            "tcp_forwarder": "1.1.1.1:53",
            "per_ip_limit": 10,
            "allow_query_ip_prefixes": ["10."],
            "public_ip_url": null
        }"#;

        let config: DaemonConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.public_ip_url, None);
    }
}
