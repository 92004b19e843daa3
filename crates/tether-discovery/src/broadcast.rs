//! DNS-SD broadcasting of the relay's presence.
//!
//! One `ServiceBroadcast` value describes one registration; it is regenerated
//! (stop + restart) whenever the bridge status changes. On start the service
//! is announced, then re-announced a few times at one-second intervals to
//! shorten client discovery latency before settling into the daemon's normal
//! refresh cadence.

use crate::error::DiscoveryError;
use crate::{
    PROTOCOL_VERSION, RAPID_ANNOUNCE_COUNT, RAPID_ANNOUNCE_INTERVAL, SERVICE_TYPE,
};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Bridge availability advertised to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    /// The relay is accepting tunnel connections
    Active,
    /// The relay is visible but not accepting tunnels
    Inactive,
}

impl BridgeStatus {
    /// TXT record representation
    pub fn as_str(self) -> &'static str {
        match self {
            BridgeStatus::Active => "active",
            BridgeStatus::Inactive => "inactive",
        }
    }
}

impl std::fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live service registration
///
/// Ephemeral configuration: a new value is built for every (re)registration.
#[derive(Debug, Clone)]
pub struct ServiceBroadcast {
    /// Device display name, used as the DNS-SD instance name
    pub device_name: String,
    /// Relay device identifier
    pub device_id: String,
    /// TCP port the relay listens on
    pub port: u16,
    /// Current bridge status
    pub status: BridgeStatus,
    /// SPKI fingerprint clients pin (lowercase hex)
    pub cert_fingerprint: String,
}

impl ServiceBroadcast {
    /// Copy of this broadcast with a different status
    pub fn with_status(&self, status: BridgeStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// TXT payload for the service record
    pub fn txt_properties(&self) -> HashMap<String, String> {
        HashMap::from([
            ("port".to_string(), self.port.to_string()),
            ("version".to_string(), PROTOCOL_VERSION.to_string()),
            ("device_id".to_string(), self.device_id.clone()),
            ("bridge_status".to_string(), self.status.as_str().to_string()),
            ("cert_hash".to_string(), self.cert_fingerprint.clone()),
        ])
    }

    /// mDNS hostname derived from the device name
    ///
    /// DNS labels cannot carry arbitrary display-name characters, so anything
    /// outside `[a-z0-9-]` collapses to a dash.
    pub fn hostname(&self) -> String {
        let label: String = self
            .device_name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let label = label.trim_matches('-');
        if label.is_empty() {
            "tether-relay.local.".to_string()
        } else {
            format!("{label}.local.")
        }
    }

    fn service_info(&self) -> Result<ServiceInfo, DiscoveryError> {
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &self.device_name,
            &self.hostname(),
            "",
            self.port,
            self.txt_properties(),
        )
        .map_err(|e| DiscoveryError::InvalidRecord(e.to_string()))?;
        Ok(info.enable_addr_auto())
    }
}

struct ActiveBroadcast {
    broadcast: ServiceBroadcast,
    fullname: String,
    rapid: JoinHandle<()>,
}

struct Inner {
    daemon: Option<ServiceDaemon>,
    active: Option<ActiveBroadcast>,
}

/// Owns the mDNS daemon handle and the current registration
///
/// All mutation goes through this component's own lock; no other component
/// holds a reference to the daemon or the live registration.
pub struct Broadcaster {
    inner: Arc<Mutex<Inner>>,
}

impl Broadcaster {
    /// Create an idle broadcaster
    ///
    /// The mDNS daemon is created lazily on the first `start`, so building a
    /// `Broadcaster` never touches the network.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                daemon: None,
                active: None,
            })),
        }
    }

    /// Register the service and begin rapid re-announcements
    ///
    /// If a registration is already live it is stopped first; the caller sees
    /// one registration at a time.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon cannot be created or the record is
    /// rejected.
    pub async fn start(&self, broadcast: ServiceBroadcast) -> Result<(), DiscoveryError> {
        let mut inner = self.inner.lock().await;

        if inner.active.is_some() {
            Self::stop_locked(&mut inner);
        }

        if inner.daemon.is_none() {
            inner.daemon = Some(ServiceDaemon::new()?);
        }
        let daemon = inner.daemon.as_ref().expect("daemon just created").clone();

        let info = broadcast.service_info()?;
        let fullname = info.get_fullname().to_string();
        daemon.register(info.clone())?;

        tracing::info!(
            service = %fullname,
            port = broadcast.port,
            status = %broadcast.status,
            "service broadcast started"
        );

        let rapid = tokio::spawn(rapid_announce(daemon, info));

        inner.active = Some(ActiveBroadcast {
            broadcast,
            fullname,
            rapid,
        });
        Ok(())
    }

    /// Republish with a new bridge status
    ///
    /// Performs a full stop + re-register rather than a TXT update, so client
    /// resolver caches never serve a stale status.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NotBroadcasting`] if nothing is live.
    pub async fn set_status(&self, status: BridgeStatus) -> Result<(), DiscoveryError> {
        let broadcast = {
            let inner = self.inner.lock().await;
            let active = inner
                .active
                .as_ref()
                .ok_or(DiscoveryError::NotBroadcasting)?;
            active.broadcast.with_status(status)
        };
        self.start(broadcast).await
    }

    /// Unregister the live service
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NotBroadcasting`] if nothing is live; this
    /// is a caller error, not a panic.
    pub async fn stop(&self) -> Result<(), DiscoveryError> {
        let mut inner = self.inner.lock().await;
        if inner.active.is_none() {
            return Err(DiscoveryError::NotBroadcasting);
        }
        Self::stop_locked(&mut inner);
        Ok(())
    }

    /// Whether a registration is currently live
    pub async fn is_broadcasting(&self) -> bool {
        self.inner.lock().await.active.is_some()
    }

    /// Status of the live registration, if any
    pub async fn current_status(&self) -> Option<BridgeStatus> {
        let inner = self.inner.lock().await;
        inner.active.as_ref().map(|a| a.broadcast.status)
    }

    /// Stop broadcasting (if live) and shut the daemon down
    ///
    /// For process exit; unlike `stop`, calling this while idle is fine.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        Self::stop_locked(&mut inner);
        if let Some(daemon) = inner.daemon.take() {
            if let Err(e) = daemon.shutdown() {
                tracing::debug!(error = %e, "mdns daemon shutdown");
            }
        }
    }

    fn stop_locked(inner: &mut Inner) {
        if let Some(active) = inner.active.take() {
            active.rapid.abort();
            if let Some(daemon) = inner.daemon.as_ref() {
                if let Err(e) = daemon.unregister(&active.fullname) {
                    tracing::debug!(service = %active.fullname, error = %e, "unregister failed");
                }
            }
            tracing::info!(service = %active.fullname, "service broadcast stopped");
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-announce a freshly registered service a few times
///
/// Cuts worst-case discovery latency for clients that missed the initial
/// announcement burst. Cancelled by aborting the task on stop.
async fn rapid_announce(daemon: ServiceDaemon, info: ServiceInfo) {
    for round in 1..=RAPID_ANNOUNCE_COUNT {
        tokio::time::sleep(RAPID_ANNOUNCE_INTERVAL).await;
        match daemon.register(info.clone()) {
            Ok(()) => tracing::trace!(round, "rapid re-announce"),
            Err(e) => {
                tracing::warn!(round, error = %e, "rapid re-announce failed");
                break;
            }
        }
    }
}
