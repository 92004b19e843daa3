//! Session connection records and their store.
//!
//! A [`ServerConnection`] is the persisted record of one logical client
//! session: who connected, when, heartbeat health, and byte totals. Records
//! are owned by the persistence layer and reached only through the device
//! lifecycle tracker; no other component mutates them directly.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Consecutive heartbeat misses that force a disconnect
pub const MAX_HEARTBEAT_FAILURES: u32 = 3;

/// Logical device identifier
///
/// Minted once per first-seen peer IP and reused while the device stays
/// inside its reconnect grace window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Mint a random device id
    pub fn mint() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(hex::encode(bytes))
    }

    /// Wrap an existing id (persistence round-trips)
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection record identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Mint a random connection id
    pub fn mint() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(hex::encode(bytes))
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derived connection quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkQuality {
    /// No heartbeat has ever been missed this session
    Excellent,
    /// Healthy steady state after recovering from misses
    Good,
    /// One consecutive miss
    Fair,
    /// Two consecutive misses
    Poor,
    /// Terminal, or the one-round state right after recovering from two
    /// consecutive misses
    Degraded,
}

/// Persisted record of one logical client session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConnection {
    /// Record identifier
    pub id: ConnectionId,
    /// Owning device
    pub device_id: DeviceId,
    /// Client platform, if known
    pub platform: String,
    /// Display name
    pub name: String,
    /// Session start
    pub established_at: DateTime<Utc>,
    /// When the last probe was sent
    pub last_heartbeat_sent: Option<DateTime<Utc>>,
    /// When the last ack was received
    pub last_heartbeat_received: Option<DateTime<Utc>>,
    /// Consecutive missed probes
    pub consecutive_failures: u32,
    /// Bytes client -> downstream
    pub bytes_sent: u64,
    /// Bytes downstream -> client
    pub bytes_received: u64,
    /// Derived quality
    pub quality: LinkQuality,
    /// Whether the session is live
    pub active: bool,
}

impl ServerConnection {
    /// Fresh record for a newly connected device
    pub fn new(device_id: DeviceId, name: impl Into<String>) -> Self {
        Self {
            id: ConnectionId::mint(),
            device_id,
            platform: "unknown".to_string(),
            name: name.into(),
            established_at: Utc::now(),
            last_heartbeat_sent: None,
            last_heartbeat_received: None,
            consecutive_failures: 0,
            bytes_sent: 0,
            bytes_received: 0,
            quality: LinkQuality::Excellent,
            active: true,
        }
    }

    /// Whether the session must be torn down
    pub fn should_terminate(&self) -> bool {
        self.consecutive_failures >= MAX_HEARTBEAT_FAILURES
    }
}

/// Field-level updates applied through the store
#[derive(Debug, Clone)]
pub enum ConnectionUpdate {
    /// Add forwarding totals
    Traffic {
        /// Bytes client -> downstream
        sent: u64,
        /// Bytes downstream -> client
        received: u64,
    },
    /// A probe was sent
    HeartbeatSent {
        /// Send time
        at: DateTime<Utc>,
    },
    /// A probe round completed
    HeartbeatResult {
        /// New consecutive-failure count
        failures: u32,
        /// New derived quality
        quality: LinkQuality,
        /// Ack receive time, if the round succeeded
        received_at: Option<DateTime<Utc>>,
    },
    /// Client-supplied metadata arrived out of band
    ClientInfo {
        /// Client platform
        platform: String,
        /// Client-chosen display name
        name: String,
    },
}

/// Store of session connection records
///
/// Operations are idempotent per connection id; `update` on an unknown id is
/// an error the relay logs and tolerates, never a crash.
pub trait ConnectionStore: Send + Sync {
    /// Record a new connection
    fn insert(&self, record: ServerConnection);

    /// Fetch one record
    fn fetch(&self, id: &ConnectionId) -> Option<ServerConnection>;

    /// All live sessions
    fn fetch_active(&self) -> Vec<ServerConnection>;

    /// Most recent sessions first, live or not
    fn fetch_recent(&self, limit: usize) -> Vec<ServerConnection>;

    /// Apply a field-level update
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no record has this id.
    fn update(&self, id: &ConnectionId, update: ConnectionUpdate) -> Result<(), StoreError>;

    /// Mark a session as ended
    ///
    /// Terminating an already-inactive record is a no-op.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no record has this id.
    fn terminate(&self, id: &ConnectionId) -> Result<(), StoreError>;

    /// Remove a record entirely
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no record has this id.
    fn delete(&self, id: &ConnectionId) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    records: HashMap<ConnectionId, ServerConnection>,
    order: Vec<ConnectionId>,
}

/// In-memory [`ConnectionStore`]
///
/// The default store for a relay session; records live as long as the
/// process. History order is insertion order.
#[derive(Default)]
pub struct MemoryConnectionStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryConnectionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionStore for MemoryConnectionStore {
    fn insert(&self, record: ServerConnection) {
        let mut inner = self.inner.lock().expect("store lock");
        if !inner.records.contains_key(&record.id) {
            inner.order.push(record.id.clone());
        }
        inner.records.insert(record.id.clone(), record);
    }

    fn fetch(&self, id: &ConnectionId) -> Option<ServerConnection> {
        self.inner.lock().expect("store lock").records.get(id).cloned()
    }

    fn fetch_active(&self) -> Vec<ServerConnection> {
        let inner = self.inner.lock().expect("store lock");
        inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id))
            .filter(|r| r.active)
            .cloned()
            .collect()
    }

    fn fetch_recent(&self, limit: usize) -> Vec<ServerConnection> {
        let inner = self.inner.lock().expect("store lock");
        inner
            .order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| inner.records.get(id))
            .cloned()
            .collect()
    }

    fn update(&self, id: &ConnectionId, update: ConnectionUpdate) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        match update {
            ConnectionUpdate::Traffic { sent, received } => {
                record.bytes_sent += sent;
                record.bytes_received += received;
            }
            ConnectionUpdate::HeartbeatSent { at } => {
                record.last_heartbeat_sent = Some(at);
            }
            ConnectionUpdate::HeartbeatResult {
                failures,
                quality,
                received_at,
            } => {
                record.consecutive_failures = failures;
                record.quality = quality;
                if let Some(at) = received_at {
                    record.last_heartbeat_received = Some(at);
                }
            }
            ConnectionUpdate::ClientInfo { platform, name } => {
                record.platform = platform;
                record.name = name;
            }
        }
        Ok(())
    }

    fn terminate(&self, id: &ConnectionId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.active = false;
        Ok(())
    }

    fn delete(&self, id: &ConnectionId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        if inner.records.remove(id).is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        inner.order.retain(|entry| entry != id);
        Ok(())
    }
}
