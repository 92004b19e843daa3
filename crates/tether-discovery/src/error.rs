//! Error types for LAN discovery.

use thiserror::Error;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The mDNS daemon rejected an operation
    #[error("mdns daemon error: {0}")]
    Daemon(String),

    /// The service record could not be constructed
    #[error("invalid service record: {0}")]
    InvalidRecord(String),

    /// `stop()` was called while nothing was being broadcast
    #[error("not broadcasting")]
    NotBroadcasting,
}

impl From<mdns_sd::Error> for DiscoveryError {
    fn from(err: mdns_sd::Error) -> Self {
        DiscoveryError::Daemon(err.to_string())
    }
}
