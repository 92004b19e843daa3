//! Relay configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the tunnel listener binds to
    pub listen_addr: SocketAddr,

    /// Downstream inspection proxy
    pub upstream: UpstreamConfig,

    /// Device display name (certificate subject, discovery instance name)
    pub device_name: String,

    /// Whether to advertise the relay over DNS-SD
    pub enable_discovery: bool,

    /// Deadline for each negotiation read (greeting, request frames)
    pub handshake_timeout: Duration,

    /// Window after a device's last connection closes during which its
    /// identity is preserved for reconnects
    pub grace_period: Duration,

    /// Heartbeat cadence and retry settings
    pub heartbeat: HeartbeatConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8889),
            upstream: UpstreamConfig::default(),
            device_name: "Tether Relay".to_string(),
            enable_discovery: true,
            handshake_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(30),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Downstream inspection-proxy endpoint
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// TCP connect deadline
    pub connect_timeout: Duration,
}

impl UpstreamConfig {
    /// `host:port` form used for connecting and logging
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Heartbeat cadence and retry settings
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Probe interval while the client reports itself foreground-active
    pub active_interval: Duration,

    /// Probe interval while the client is backgrounded
    pub background_interval: Duration,

    /// How long to wait for an ack
    pub response_timeout: Duration,

    /// Delay before retrying after a missed probe
    pub retry_delay: Duration,

    /// Consecutive misses that force a disconnect
    pub max_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_secs(30),
            background_interval: Duration::from_secs(60),
            response_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(10),
            max_failures: 3,
        }
    }
}
