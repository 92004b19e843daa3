//! Observable streams for UI-layer consumers.
//!
//! The relay exposes two streams: the current device set (every lifecycle
//! change republishes the full set, in state-change order) and the relay
//! listening status. Both support multiple concurrent subscribers; a
//! subscriber unsubscribes by dropping its receiver, and a slow subscriber
//! only ever loses its own backlog.

use crate::store::DeviceId;
use chrono::{DateTime, Utc};
use std::net::{IpAddr, SocketAddr};
use tokio::sync::{broadcast, watch};

/// Device liveness as seen by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// At least one live connection
    Active,
    /// Last connection closed; inside the reconnect grace window
    PendingRemoval,
    /// Gone (final state, devices in this state leave the set)
    Removed,
}

/// Point-in-time view of one tracked device
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    /// Logical device id
    pub id: DeviceId,
    /// Display name
    pub name: String,
    /// Peer IP the device connects from
    pub addr: IpAddr,
    /// When the device first connected (this session)
    pub connected_at: DateTime<Utc>,
    /// Live connection count
    pub connections: usize,
    /// Cumulative bytes client -> downstream
    pub bytes_sent: u64,
    /// Cumulative bytes downstream -> client
    pub bytes_received: u64,
    /// Lifecycle state
    pub liveness: Liveness,
    /// Most recent tunnel destination; `None` while still pending
    pub destination: Option<String>,
}

/// Relay listening status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// Not accepting connections
    Stopped,
    /// Accepting connections on this address
    Listening(SocketAddr),
}

/// Publish side of the relay's observable streams
#[derive(Clone)]
pub struct EventBus {
    devices: broadcast::Sender<Vec<DeviceSnapshot>>,
    status: watch::Sender<RelayStatus>,
}

impl EventBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        let (devices, _) = broadcast::channel(64);
        let (status, _) = watch::channel(RelayStatus::Stopped);
        Self { devices, status }
    }

    /// Subscribe to device-set updates
    pub fn subscribe_devices(&self) -> broadcast::Receiver<Vec<DeviceSnapshot>> {
        self.devices.subscribe()
    }

    /// Watch the relay listening status
    pub fn watch_status(&self) -> watch::Receiver<RelayStatus> {
        self.status.subscribe()
    }

    /// Current listening status
    pub fn status(&self) -> RelayStatus {
        *self.status.borrow()
    }

    pub(crate) fn publish_devices(&self, set: Vec<DeviceSnapshot>) {
        // Err just means nobody is subscribed right now
        let _ = self.devices.send(set);
    }

    pub(crate) fn set_status(&self, status: RelayStatus) {
        let _ = self.status.send(status);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
