//! Error types for the tether relay engine.

use thiserror::Error;

/// Core relay errors
#[derive(Debug, Error)]
pub enum Error {
    /// Wire-level protocol error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Relay startup error
    #[error("startup error: {0}")]
    Startup(#[from] StartupError),

    /// Persistence error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Socket I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire-level errors from the tunnel protocol
///
/// Fatal errors desynchronize the byte stream and force a socket close;
/// non-fatal errors are answered with a reply frame while the connection
/// stays open for further requests.
#[derive(Debug, Error)]
pub enum WireError {
    /// The peer closed mid-frame or sent fewer bytes than the frame declares
    #[error("truncated frame")]
    Truncated,

    /// Version byte did not match the protocol version
    #[error("unsupported protocol version: 0x{0:02X}")]
    BadVersion(u8),

    /// Request named a command other than connect
    #[error("unsupported command: 0x{0:02X}")]
    UnsupportedCommand(u8),

    /// Request carried an unknown address-type byte
    #[error("unsupported address type: 0x{0:02X}")]
    UnsupportedAddressType(u8),

    /// Domain destination with a zero-length name
    #[error("empty domain name")]
    EmptyDomain,

    /// Domain bytes were not valid UTF-8
    #[error("domain name is not valid utf-8")]
    BadDomainEncoding,

    /// Underlying socket failure
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Whether the stream is unrecoverable and must be closed
    ///
    /// Anything that consumed an unknowable number of bytes, or failed to
    /// produce the bytes a frame declared, cannot be re-synchronized.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WireError::Truncated | WireError::BadVersion(_) | WireError::Io(_)
        )
    }
}

/// Relay startup failures
///
/// Each variant carries enough to render a user-facing message together with
/// a suggested recovery action.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The listening port is already bound by another process
    #[error("listen port {port} is already in use")]
    PortInUse {
        /// The configured port
        port: u16,
        /// Bind failure detail
        #[source]
        source: std::io::Error,
    },

    /// The listener could not be bound for another reason
    #[error("failed to bind listener on port {port}: {source}")]
    Bind {
        /// The configured port
        port: u16,
        /// Bind failure detail
        #[source]
        source: std::io::Error,
    },

    /// The relay identity could not be loaded or generated
    #[error("relay identity unavailable: {0}")]
    Identity(#[from] tether_identity::IdentityError),

    /// The discovery broadcast could not be started
    #[error("service broadcast failed: {0}")]
    Broadcast(#[from] tether_discovery::DiscoveryError),

    /// The relay is already running
    #[error("relay is already enabled")]
    AlreadyEnabled,
}

impl StartupError {
    /// Suggested recovery action for a user-facing message
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            StartupError::PortInUse { .. } => "choose a different listening port",
            StartupError::Bind { .. } => "check network permissions and restart the relay",
            StartupError::Identity(_) => "reset the relay identity and relaunch",
            StartupError::Broadcast(_) => "restart the relay; LAN discovery may be unavailable",
            StartupError::AlreadyEnabled => "disable the relay before enabling it again",
        }
    }
}

/// Persistence errors
///
/// A missing record on update is logged and tolerated by every caller; the
/// relay keeps serving.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with the given connection id
    #[error("connection record not found: {0}")]
    NotFound(String),

    /// Durable store could not be read or written
    #[error("store i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Durable store contents could not be decoded
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_wire_errors() {
        assert!(WireError::Truncated.is_fatal());
        assert!(WireError::BadVersion(0x04).is_fatal());
        assert!(!WireError::EmptyDomain.is_fatal());
        assert!(!WireError::UnsupportedCommand(0x02).is_fatal());
        assert!(!WireError::UnsupportedAddressType(0x02).is_fatal());
    }

    #[test]
    fn test_recovery_hints_are_actionable() {
        let err = StartupError::PortInUse {
            port: 8889,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.recovery_hint().contains("port"));
        assert!(err.to_string().contains("8889"));
    }
}
