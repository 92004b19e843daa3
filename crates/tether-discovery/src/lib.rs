//! # Tether Discovery
//!
//! LAN presence broadcasting for the Tether relay.
//!
//! The relay advertises itself over multicast DNS (DNS-SD) so mobile clients
//! can find it without manual configuration. The TXT payload carries the
//! listening port, protocol version, relay device id, bridge status, and the
//! certificate fingerprint clients pin under TOFU:
//!
//! ```text
//! _tether-bridge._tcp.local.  TXT  port=8889 version=1 device_id=...
//!                                  bridge_status=active cert_hash=ab12...
//! ```
//!
//! Status changes are published by stopping and re-registering the service
//! rather than mutating TXT records in place, which avoids stale-cache
//! behavior on client resolvers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod error;

pub use broadcast::{BridgeStatus, Broadcaster, ServiceBroadcast};
pub use error::DiscoveryError;

/// DNS-SD service type the relay registers under
pub const SERVICE_TYPE: &str = "_tether-bridge._tcp.local.";

/// DNS-SD domain (link-local only)
pub const SERVICE_DOMAIN: &str = "local.";

/// Bridge protocol version advertised in TXT records
pub const PROTOCOL_VERSION: &str = "1";

/// Number of extra announcements sent right after registration
pub const RAPID_ANNOUNCE_COUNT: u32 = 3;

/// Delay between rapid announcements
pub const RAPID_ANNOUNCE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
