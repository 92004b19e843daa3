//! # Tether Identity
//!
//! Relay identity management for the Tether bridge.
//!
//! The relay authenticates itself to mobile clients with a self-signed TLS
//! identity. Clients pin the SHA-256 fingerprint of the relay's public key on
//! first connection (trust-on-first-use) and alert on any future mismatch, so
//! the identity must be stable across relaunches and only change through an
//! explicit trust reset.
//!
//! This crate provides:
//! - Generation and durable storage of the relay keypair and certificate
//! - SPKI fingerprint computation (the value clients pin)
//! - Explicit regeneration (trust reset)
//!
//! # Example
//!
//! ```no_run
//! use tether_identity::CertificateAuthority;
//!
//! let authority = CertificateAuthority::new("/var/lib/tether", "My Desktop");
//! let identity = authority.load_or_generate().expect("identity unavailable");
//! println!("pin: {}", identity.fingerprint());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod authority;
pub mod error;

pub use authority::{CertificateAuthority, RelayIdentity, spki_fingerprint};
pub use error::IdentityError;

/// Certificate validity in days (10 years)
pub const CERTIFICATE_VALIDITY_DAYS: i64 = 3650;

/// RSA key size in bits
pub const KEY_BITS: usize = 2048;
