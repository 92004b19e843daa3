//! Error types for relay identity management.

use thiserror::Error;

/// Identity errors
///
/// All variants are fatal to relay startup: the relay must not serve clients
/// without a stable identity, since a missing identity would break every
/// previously pinned fingerprint.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Keypair generation failed
    #[error("keypair generation failed: {0}")]
    KeyGeneration(String),

    /// Key encoding or decoding failed
    #[error("key encoding failed: {0}")]
    KeyEncoding(String),

    /// Certificate construction failed
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    /// The identity directory holds only part of an identity
    ///
    /// A certificate without its key (or vice versa) cannot be trusted or
    /// repaired automatically; the caller must reset the identity.
    #[error("identity store is incomplete: missing {0}")]
    Incomplete(&'static str),

    /// Filesystem failure while reading or writing the identity
    #[error("identity store i/o: {0}")]
    Io(#[from] std::io::Error),
}
