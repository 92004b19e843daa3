//! # Tether Core
//!
//! Core relay engine for the Tether bridge: mobile debugging clients
//! connect over a SOCKS5-compatible tunnel, and the relay forwards their
//! traffic through an HTTP CONNECT tunnel into a traffic-inspection proxy
//! while tracking device lifecycles and link health.
//!
//! This crate provides:
//! - The per-connection protocol state machine and its async driver
//! - The peer address policy (LAN-only, silent rejection)
//! - Device lifecycle tracking with reconnect grace periods
//! - Heartbeat health monitoring with retry and forced teardown
//! - Session and pairing persistence
//! - Relay orchestration and the observable streams the UI consumes
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Relay                               │
//! │     (accept loop, policy gate, supervisor, lifecycle)        │
//! ├──────────────┬───────────────────┬───────────────────────────┤
//! │ Engine       │ Device Tracker    │ Heartbeat Monitors        │
//! │ (per socket) │ (grace windows)   │ (one per device)          │
//! ├──────────────┴───────────────────┴───────────────────────────┤
//! │ Wire codec   │ Stores (sessions, pairings) │ Event streams   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod machine;
pub mod pairing;
pub mod policy;
pub mod relay;
pub mod store;
pub mod tracker;
pub mod wire;

pub use config::{HeartbeatConfig, RelayConfig, UpstreamConfig};
pub use error::{Error, StartupError, StoreError, WireError};
pub use events::{DeviceSnapshot, EventBus, Liveness, RelayStatus};
pub use heartbeat::{AppState, HeartbeatEvent, HeartbeatMonitor, ProbeOutcome, ProbeTransport};
pub use machine::{Effect, Event, HandshakeState, MalformedKind, step};
pub use pairing::{PAIRING_EXPIRY_DAYS, PairingRecord, PairingStore};
pub use relay::Relay;
pub use store::{
    ConnectionId, ConnectionStore, ConnectionUpdate, DeviceId, LinkQuality,
    MAX_HEARTBEAT_FAILURES, MemoryConnectionStore, ServerConnection,
};
pub use tracker::{DeviceProbe, DeviceTracker, TrackerEvent};
pub use wire::{DestAddr, Reply, RequestFrame};
