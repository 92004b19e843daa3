//! Relay orchestration.
//!
//! Assembles the pieces in dependency order: identity first (the discovery
//! broadcast needs its fingerprint), then the DNS-SD broadcast, then the
//! tunnel listener. One accept-loop task gates peers through the address
//! policy and spawns a driver task per socket; one supervisor task starts a
//! heartbeat monitor per device and tears devices down on heartbeat
//! timeout. Errors in any connection task stay in that task.

use crate::config::{HeartbeatConfig, RelayConfig};
use crate::engine;
use crate::error::StartupError;
use crate::events::{DeviceSnapshot, EventBus, RelayStatus};
use crate::heartbeat::{AppState, HeartbeatEvent, HeartbeatHandle, HeartbeatMonitor};
use crate::pairing::PairingStore;
use crate::policy;
use crate::store::{ConnectionStore, DeviceId};
use crate::tracker::{DeviceProbe, DeviceTracker, TrackerEvent};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tether_discovery::{BridgeStatus, Broadcaster, ServiceBroadcast};
use tether_identity::{CertificateAuthority, RelayIdentity};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

struct Running {
    tracker: DeviceTracker,
    accept: JoinHandle<()>,
    supervisor: JoinHandle<()>,
    supervisor_shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

/// The relay: tunnel listener, device tracking, health monitoring, and
/// LAN presence rolled into one lifecycle
pub struct Relay {
    config: RelayConfig,
    authority: Arc<CertificateAuthority>,
    identity: Mutex<Option<RelayIdentity>>,
    store: Arc<dyn ConnectionStore>,
    pairing: Arc<PairingStore>,
    events: EventBus,
    broadcaster: Broadcaster,
    app_state: watch::Sender<AppState>,
    running: Mutex<Option<Running>>,
}

impl Relay {
    /// Create a relay; nothing starts until [`Relay::enable`]
    pub fn new(
        config: RelayConfig,
        authority: CertificateAuthority,
        store: Arc<dyn ConnectionStore>,
        pairing: Arc<PairingStore>,
    ) -> Self {
        let (app_state, _) = watch::channel(AppState::Foreground);
        Self {
            config,
            authority: Arc::new(authority),
            identity: Mutex::new(None),
            store,
            pairing,
            events: EventBus::new(),
            broadcaster: Broadcaster::new(),
            app_state,
            running: Mutex::new(None),
        }
    }

    /// Start serving: identity, broadcast, listener, accept loop
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Typed [`StartupError`]s with recovery hints: identity failures are
    /// fatal (no partial identity is persisted), a busy port reports
    /// [`StartupError::PortInUse`], and enabling twice is rejected.
    pub async fn enable(&self) -> Result<SocketAddr, StartupError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(StartupError::AlreadyEnabled);
        }

        // RSA keypair generation is CPU-heavy on first launch
        let authority = Arc::clone(&self.authority);
        let identity = tokio::task::spawn_blocking(move || authority.load_or_generate())
            .await
            .expect("identity task panicked")?;
        let fingerprint = identity.fingerprint().to_string();
        *self.identity.lock().await = Some(identity);

        if self.config.enable_discovery {
            self.broadcaster
                .start(self.service_broadcast(&fingerprint, BridgeStatus::Active))
                .await?;
        }

        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| {
                let port = self.config.listen_addr.port();
                if e.kind() == std::io::ErrorKind::AddrInUse {
                    StartupError::PortInUse { port, source: e }
                } else {
                    StartupError::Bind { port, source: e }
                }
            })?;
        let local_addr = listener.local_addr().map_err(|e| StartupError::Bind {
            port: self.config.listen_addr.port(),
            source: e,
        })?;

        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let tracker = DeviceTracker::new(
            self.events.clone(),
            lifecycle_tx,
            Arc::clone(&self.store),
            Arc::clone(&self.pairing),
            fingerprint,
            self.config.grace_period,
        );

        let (supervisor_shutdown, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(
            tracker.clone(),
            lifecycle_rx,
            shutdown_rx,
            self.config.heartbeat.clone(),
            Arc::clone(&self.store),
            self.app_state.subscribe(),
        ));
        let accept = tokio::spawn(accept_loop(
            listener,
            tracker.clone(),
            Arc::new(self.config.clone()),
        ));

        self.events.set_status(RelayStatus::Listening(local_addr));
        tracing::info!(%local_addr, "relay enabled");

        *running = Some(Running {
            tracker,
            accept,
            supervisor,
            supervisor_shutdown,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop serving: close every connection, stop monitors, flip the
    /// broadcast to inactive
    ///
    /// Disabling a relay that is not running is a no-op.
    pub async fn disable(&self) {
        let mut running = self.running.lock().await;
        let Some(state) = running.take() else {
            return;
        };

        state.accept.abort();
        let _ = state.accept.await;
        state.tracker.shutdown_all().await;
        let _ = state.supervisor_shutdown.send(true);
        let _ = state.supervisor.await;

        if self.config.enable_discovery {
            // Status change, not silence: clients should see the bridge go
            // inactive rather than vanish from caches at its own pace.
            if let Err(e) = self.broadcaster.set_status(BridgeStatus::Inactive).await {
                tracing::warn!(error = %e, "broadcast status change failed");
            }
        }

        self.events.set_status(RelayStatus::Stopped);
        tracing::info!(local_addr = %state.local_addr, "relay disabled");
    }

    /// Whether the relay is currently listening
    pub async fn is_enabled(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Current listening status
    pub fn status(&self) -> RelayStatus {
        self.events.status()
    }

    /// Subscribe to device-set updates
    pub fn subscribe_devices(&self) -> broadcast::Receiver<Vec<DeviceSnapshot>> {
        self.events.subscribe_devices()
    }

    /// Watch the listening status
    pub fn watch_status(&self) -> watch::Receiver<RelayStatus> {
        self.events.watch_status()
    }

    /// Identity fingerprint, once enabled
    pub async fn fingerprint(&self) -> Option<String> {
        self.identity
            .lock()
            .await
            .as_ref()
            .map(|identity| identity.fingerprint().to_string())
    }

    /// Update the client-reported application state (heartbeat cadence)
    pub fn set_client_app_state(&self, state: AppState) {
        let _ = self.app_state.send(state);
    }

    /// The pairing store this relay records into
    pub fn pairing(&self) -> &Arc<PairingStore> {
        &self.pairing
    }

    /// The session record store
    pub fn store(&self) -> &Arc<dyn ConnectionStore> {
        &self.store
    }

    fn service_broadcast(&self, fingerprint: &str, status: BridgeStatus) -> ServiceBroadcast {
        ServiceBroadcast {
            device_name: self.config.device_name.clone(),
            device_id: fingerprint[..16].to_string(),
            port: self.config.listen_addr.port(),
            status,
            cert_fingerprint: fingerprint.to_string(),
        }
    }
}

/// Accept sockets, gate them through the address policy, spawn drivers
async fn accept_loop(listener: TcpListener, tracker: DeviceTracker, config: Arc<RelayConfig>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if !policy::permits_peer(peer.ip()) {
                    // Silent close: no bytes reach a disallowed peer
                    tracing::debug!(%peer, "peer rejected by address policy");
                    continue;
                }
                tracing::debug!(%peer, "connection accepted");
                let tracker = tracker.clone();
                let config = Arc::clone(&config);
                tokio::spawn(engine::serve_connection(
                    stream,
                    peer.ip(),
                    tracker,
                    config,
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

struct MonitorEntry {
    ip: IpAddr,
    handle: HeartbeatHandle,
}

/// Start/stop heartbeat monitors as devices come and go; tear devices down
/// when their monitor reports a terminal timeout
async fn supervise(
    tracker: DeviceTracker,
    mut lifecycle: mpsc::UnboundedReceiver<TrackerEvent>,
    mut shutdown: watch::Receiver<bool>,
    heartbeat: HeartbeatConfig,
    store: Arc<dyn ConnectionStore>,
    app_state: watch::Receiver<AppState>,
) {
    let mut monitors: HashMap<DeviceId, MonitorEntry> = HashMap::new();
    let (health_tx, mut health_rx) = mpsc::unbounded_channel::<HeartbeatEvent>();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = lifecycle.recv() => {
                let Some(event) = event else { break };
                match event {
                    TrackerEvent::DeviceAdded { ip, device_id, connection_id } => {
                        let monitor = HeartbeatMonitor::new(
                            heartbeat.clone(),
                            device_id.clone(),
                            connection_id,
                            DeviceProbe::new(tracker.clone(), ip),
                            Arc::clone(&store),
                            app_state.clone(),
                            health_tx.clone(),
                        );
                        monitors.insert(device_id, MonitorEntry { ip, handle: monitor.spawn() });
                    }
                    TrackerEvent::DeviceRemoved { device_id, .. } => {
                        if let Some(entry) = monitors.remove(&device_id) {
                            entry.handle.stop();
                        }
                    }
                }
            }
            event = health_rx.recv() => {
                match event {
                    Some(HeartbeatEvent::TimedOut { device_id, .. }) => {
                        if let Some(entry) = monitors.remove(&device_id) {
                            tracing::warn!(device = %device_id, "heartbeat timeout, disconnecting device");
                            tracker.force_disconnect(entry.ip).await;
                            entry.handle.stop();
                        }
                    }
                    Some(HeartbeatEvent::Healthy { device_id, quality }) => {
                        tracing::trace!(device = %device_id, ?quality, "heartbeat ok");
                    }
                    Some(HeartbeatEvent::Missed { device_id, failures }) => {
                        tracing::debug!(device = %device_id, failures, "heartbeat missed");
                    }
                    None => break,
                }
            }
        }
    }

    for (_, entry) in monitors {
        entry.handle.stop();
    }
}
