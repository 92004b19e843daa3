//! Configuration system for the Tether CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Tether configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relay configuration
    #[serde(default)]
    pub relay: RelaySection,
    /// Downstream inspection proxy
    #[serde(default)]
    pub proxy: ProxySection,
    /// LAN discovery
    #[serde(default)]
    pub discovery: DiscoverySection,
    /// State storage
    #[serde(default)]
    pub storage: StorageSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Relay listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Device display name shown to pairing clients
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

/// Downstream proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySection {
    /// Inspection proxy host
    #[serde(default = "default_proxy_host")]
    pub host: String,
    /// Inspection proxy port
    #[serde(default = "default_proxy_port")]
    pub port: u16,
}

/// Discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    /// Advertise the relay over DNS-SD
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Directory for identity and pairing state
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:8889".to_string()
}

fn default_device_name() -> String {
    "Tether Relay".to_string()
}

fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_port() -> u16 {
    8888
}

fn default_true() -> bool {
    true
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("tether")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            device_name: default_device_name(),
        }
    }
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            host: default_proxy_host(),
            port: default_proxy_port(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("tether/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse the listen address as a `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.relay.listen_addr.parse()?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        if self.relay.device_name.trim().is_empty() {
            anyhow::bail!("Device name must not be empty");
        }

        if self.proxy.host.is_empty() {
            anyhow::bail!("Proxy host must not be empty");
        }
        if self.proxy.host.contains('/') || self.proxy.host.contains('\\') {
            anyhow::bail!("Proxy host '{}' contains invalid characters", self.proxy.host);
        }
        if self.proxy.port == 0 {
            anyhow::bail!("Proxy port must not be 0");
        }

        // The proxy must not point back at the relay listener
        if let Ok(listen) = self.parse_listen_addr() {
            if listen.port() == self.proxy.port {
                if let Ok(proxy_ip) = self.proxy.host.parse::<IpAddr>() {
                    if proxy_ip.is_loopback() || proxy_ip == listen.ip() {
                        anyhow::bail!(
                            "Proxy {}:{} would loop back into the relay listener",
                            self.proxy.host,
                            self.proxy.port
                        );
                    }
                }
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Build the core relay configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be parsed.
    pub fn to_relay_config(&self) -> anyhow::Result<tether_core::RelayConfig> {
        Ok(tether_core::RelayConfig {
            listen_addr: self.parse_listen_addr()?,
            upstream: tether_core::UpstreamConfig {
                host: self.proxy.host.clone(),
                port: self.proxy.port,
                ..tether_core::UpstreamConfig::default()
            },
            device_name: self.relay.device_name.clone(),
            enable_discovery: self.discovery.enabled,
            ..tether_core::RelayConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.listen_addr, "0.0.0.0:8889");
        assert_eq!(config.proxy.host, "127.0.0.1");
        assert_eq!(config.proxy.port, 8888);
        assert!(config.discovery.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.logging.level = "noisy".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        config.proxy.port = 0;
        assert!(config.validate().is_err());

        config.proxy.port = 8888;
        config.relay.listen_addr = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_proxy_loop_is_rejected() {
        let mut config = Config::default();
        config.relay.listen_addr = "0.0.0.0:8888".to_string();
        config.proxy.host = "127.0.0.1".to_string();
        config.proxy.port = 8888;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let decoded: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.relay.listen_addr, decoded.relay.listen_addr);
        assert_eq!(config.proxy.port, decoded.proxy.port);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let decoded: Config = toml::from_str("[proxy]\nport = 9999\n").unwrap();
        assert_eq!(decoded.proxy.port, 9999);
        assert_eq!(decoded.relay.listen_addr, "0.0.0.0:8889");
    }

    #[test]
    fn test_to_relay_config() {
        let config = Config::default();
        let relay = config.to_relay_config().unwrap();
        assert_eq!(relay.listen_addr.port(), 8889);
        assert_eq!(relay.upstream.authority(), "127.0.0.1:8888");
    }
}
