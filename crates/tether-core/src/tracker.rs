//! Device lifecycle tracking.
//!
//! Maps transport-level connections to logical devices keyed by peer IP.
//! A device may hold several simultaneous connections (reference-counted);
//! closing the last one does not remove the device immediately but starts a
//! 30-second grace timer, so the multi-socket churn of a single client does
//! not flap the consumer-visible device list. A reconnect inside the window
//! cancels the timer and reuses the existing device record.
//!
//! All state lives behind this component's own lock. Each device carries a
//! generation counter; the grace timer captures the generation it was
//! scheduled under and re-checks it under the lock before removing, so a
//! cancel that lands before the removal action always wins.

use crate::events::{DeviceSnapshot, EventBus, Liveness};
use crate::heartbeat::{ProbeCommand, ProbeOutcome, ProbeTransport};
use crate::pairing::PairingStore;
use crate::store::{ConnectionId, ConnectionStore, ConnectionUpdate, DeviceId, ServerConnection};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Lifecycle notifications for the relay supervisor
#[derive(Debug)]
pub enum TrackerEvent {
    /// A brand-new device connected; a heartbeat monitor should start
    DeviceAdded {
        /// Peer IP
        ip: IpAddr,
        /// Minted device id
        device_id: DeviceId,
        /// Session record id
        connection_id: ConnectionId,
    },
    /// A device left (grace expired, forced disconnect, or shutdown)
    DeviceRemoved {
        /// Peer IP
        ip: IpAddr,
        /// Device id
        device_id: DeviceId,
        /// Session record id
        connection_id: ConnectionId,
    },
}

/// What the engine driver gets back when it reports an established connection
#[derive(Debug)]
pub struct EstablishedConnection {
    /// Owning device
    pub device_id: DeviceId,
    /// Session record
    pub connection_id: ConnectionId,
    /// Whether this connection minted a new device
    pub is_new_device: bool,
    /// Signal the driver must watch; flips when the device is force-closed
    pub shutdown: watch::Receiver<bool>,
}

struct DeviceEntry {
    device_id: DeviceId,
    connection_id: ConnectionId,
    name: String,
    connected_at: DateTime<Utc>,
    connections: usize,
    bytes_sent: u64,
    bytes_received: u64,
    liveness: Liveness,
    destination: Option<String>,
    generation: u64,
    removal: Option<JoinHandle<()>>,
    probe: Option<mpsc::Sender<ProbeCommand>>,
    shutdown: watch::Sender<bool>,
}

impl DeviceEntry {
    fn snapshot(&self, addr: IpAddr) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.device_id.clone(),
            name: self.name.clone(),
            addr,
            connected_at: self.connected_at,
            connections: self.connections,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            liveness: self.liveness,
            destination: self.destination.clone(),
        }
    }
}

/// Tracks the set of connected devices
///
/// Cheap to clone; all clones share one serialized state.
#[derive(Clone)]
pub struct DeviceTracker {
    inner: Arc<Mutex<HashMap<IpAddr, DeviceEntry>>>,
    events: EventBus,
    notifications: mpsc::UnboundedSender<TrackerEvent>,
    store: Arc<dyn ConnectionStore>,
    pairing: Arc<PairingStore>,
    relay_fingerprint: String,
    grace_period: Duration,
}

impl DeviceTracker {
    /// Create a tracker
    pub fn new(
        events: EventBus,
        notifications: mpsc::UnboundedSender<TrackerEvent>,
        store: Arc<dyn ConnectionStore>,
        pairing: Arc<PairingStore>,
        relay_fingerprint: impl Into<String>,
        grace_period: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            events,
            notifications,
            store,
            pairing,
            relay_fingerprint: relay_fingerprint.into(),
            grace_period,
        }
    }

    /// A connection finished its greeting exchange
    ///
    /// First connection from an unseen IP mints a device id, creates the
    /// session record, and records the pairing success. A reconnect inside
    /// the grace window cancels the pending removal and reuses the device.
    pub async fn connection_established(&self, ip: IpAddr) -> EstablishedConnection {
        let mut devices = self.inner.lock().await;

        let established = match devices.get_mut(&ip) {
            Some(entry) => {
                // Supersede any pending removal; the bumped generation makes
                // a timer that already fired fail its re-check.
                entry.generation += 1;
                if let Some(timer) = entry.removal.take() {
                    timer.abort();
                }
                entry.liveness = Liveness::Active;
                entry.connections += 1;
                tracing::debug!(
                    %ip,
                    device = %entry.device_id,
                    connections = entry.connections,
                    "connection joined existing device"
                );
                EstablishedConnection {
                    device_id: entry.device_id.clone(),
                    connection_id: entry.connection_id.clone(),
                    is_new_device: false,
                    shutdown: entry.shutdown.subscribe(),
                }
            }
            None => {
                let device_id = DeviceId::mint();
                let name = format!("Device {ip}");
                let record = ServerConnection::new(device_id.clone(), name.clone());
                let connection_id = record.id.clone();
                self.store.insert(record);

                if let Err(e) = self
                    .pairing
                    .record_success(&self.relay_fingerprint, &device_id)
                {
                    tracing::warn!(device = %device_id, error = %e, "pairing record skipped");
                }

                let (shutdown, shutdown_rx) = watch::channel(false);
                devices.insert(
                    ip,
                    DeviceEntry {
                        device_id: device_id.clone(),
                        connection_id: connection_id.clone(),
                        name,
                        connected_at: Utc::now(),
                        connections: 1,
                        bytes_sent: 0,
                        bytes_received: 0,
                        liveness: Liveness::Active,
                        destination: None,
                        generation: 0,
                        removal: None,
                        probe: None,
                        shutdown,
                    },
                );

                tracing::info!(%ip, device = %device_id, "device connected");
                let _ = self.notifications.send(TrackerEvent::DeviceAdded {
                    ip,
                    device_id: device_id.clone(),
                    connection_id: connection_id.clone(),
                });
                EstablishedConnection {
                    device_id,
                    connection_id,
                    is_new_device: true,
                    shutdown: shutdown_rx,
                }
            }
        };

        self.publish(&devices);
        established
    }

    /// A connection closed
    ///
    /// When it was the device's last connection the device enters the grace
    /// window instead of disappearing.
    pub async fn connection_closed(&self, ip: IpAddr) {
        let mut devices = self.inner.lock().await;
        let Some(entry) = devices.get_mut(&ip) else {
            tracing::warn!(%ip, "close for untracked peer ignored");
            return;
        };

        entry.connections = entry.connections.saturating_sub(1);
        if entry.connections == 0 {
            entry.liveness = Liveness::PendingRemoval;
            entry.generation += 1;
            if let Some(timer) = entry.removal.take() {
                timer.abort();
            }
            entry.removal = Some(self.spawn_removal(ip, entry.generation));
            tracing::debug!(%ip, device = %entry.device_id, "last connection closed, grace timer started");
        }
        self.publish(&devices);
    }

    /// Add forwarding totals for a device
    pub async fn traffic_update(&self, ip: IpAddr, sent: u64, received: u64) {
        let mut devices = self.inner.lock().await;
        let Some(entry) = devices.get_mut(&ip) else {
            tracing::warn!(%ip, "traffic update for untracked peer ignored");
            return;
        };
        entry.bytes_sent += sent;
        entry.bytes_received += received;

        if let Err(e) = self.store.update(
            &entry.connection_id,
            ConnectionUpdate::Traffic { sent, received },
        ) {
            tracing::warn!(connection = %entry.connection_id, error = %e, "traffic record skipped");
        }
        self.publish(&devices);
    }

    /// Record the destination of the device's latest tunnel
    pub async fn destination_update(&self, ip: IpAddr, destination: String) {
        let mut devices = self.inner.lock().await;
        if let Some(entry) = devices.get_mut(&ip) {
            entry.destination = Some(destination);
            self.publish(&devices);
        }
    }

    /// Register the connection that services heartbeat probes for a device
    ///
    /// The latest registered channel wins; there is one control connection
    /// per device at a time.
    pub async fn register_probe_channel(&self, ip: IpAddr, channel: mpsc::Sender<ProbeCommand>) {
        let mut devices = self.inner.lock().await;
        if let Some(entry) = devices.get_mut(&ip) {
            entry.probe = Some(channel);
        }
    }

    /// Drop the probe registration if `channel` still holds it
    pub async fn clear_probe_channel(&self, ip: IpAddr, channel: &mpsc::Sender<ProbeCommand>) {
        let mut devices = self.inner.lock().await;
        if let Some(entry) = devices.get_mut(&ip) {
            if entry
                .probe
                .as_ref()
                .is_some_and(|current| current.same_channel(channel))
            {
                entry.probe = None;
            }
        }
    }

    pub(crate) async fn probe_channel(&self, ip: IpAddr) -> Option<mpsc::Sender<ProbeCommand>> {
        let devices = self.inner.lock().await;
        devices.get(&ip).and_then(|entry| entry.probe.clone())
    }

    /// Remove a device immediately, closing its connections
    ///
    /// Used for heartbeat-timeout teardown; the grace window does not apply.
    pub async fn force_disconnect(&self, ip: IpAddr) {
        let mut devices = self.inner.lock().await;
        self.remove_locked(&mut devices, ip);
        self.publish(&devices);
    }

    /// Remove every device (relay shutdown)
    pub async fn shutdown_all(&self) {
        let mut devices = self.inner.lock().await;
        let ips: Vec<IpAddr> = devices.keys().copied().collect();
        for ip in ips {
            self.remove_locked(&mut devices, ip);
        }
        self.publish(&devices);
    }

    /// Current device set, in connection order
    pub async fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let devices = self.inner.lock().await;
        Self::snapshots(&devices)
    }

    /// Number of tracked devices (including those in grace)
    pub async fn device_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    fn spawn_removal(&self, ip: IpAddr, generation: u64) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.grace_period).await;
            tracker.expire(ip, generation).await;
        })
    }

    async fn expire(&self, ip: IpAddr, generation: u64) {
        let mut devices = self.inner.lock().await;
        let still_due = devices
            .get(&ip)
            .is_some_and(|entry| entry.generation == generation && entry.connections == 0);
        if !still_due {
            // Superseded by a reconnect between timer fire and lock acquisition
            return;
        }
        self.remove_locked(&mut devices, ip);
        self.publish(&devices);
    }

    fn remove_locked(&self, devices: &mut HashMap<IpAddr, DeviceEntry>, ip: IpAddr) {
        let Some(entry) = devices.remove(&ip) else {
            return;
        };
        if let Some(timer) = entry.removal {
            timer.abort();
        }
        let _ = entry.shutdown.send(true);

        if let Err(e) = self.store.terminate(&entry.connection_id) {
            tracing::warn!(connection = %entry.connection_id, error = %e, "terminate record skipped");
        }

        tracing::info!(%ip, device = %entry.device_id, "device removed");
        let _ = self.notifications.send(TrackerEvent::DeviceRemoved {
            ip,
            device_id: entry.device_id,
            connection_id: entry.connection_id,
        });
    }

    fn publish(&self, devices: &HashMap<IpAddr, DeviceEntry>) {
        self.events.publish_devices(Self::snapshots(devices));
    }

    fn snapshots(devices: &HashMap<IpAddr, DeviceEntry>) -> Vec<DeviceSnapshot> {
        let mut set: Vec<DeviceSnapshot> = devices
            .iter()
            .map(|(ip, entry)| entry.snapshot(*ip))
            .collect();
        set.sort_by_key(|snapshot| snapshot.connected_at);
        set
    }
}

/// Probe transport that reaches a device through its control connection
///
/// Looks the channel up per round, so the monitor survives the device
/// migrating its control connection. No registered channel counts as a
/// miss: a healthy client always keeps its control connection open.
pub struct DeviceProbe {
    tracker: DeviceTracker,
    ip: IpAddr,
}

impl DeviceProbe {
    /// Probe transport for the device at `ip`
    pub fn new(tracker: DeviceTracker, ip: IpAddr) -> Self {
        Self { tracker, ip }
    }
}

impl ProbeTransport for DeviceProbe {
    fn probe(&mut self, timeout: Duration) -> impl Future<Output = ProbeOutcome> + Send {
        let tracker = self.tracker.clone();
        let ip = self.ip;
        async move {
            let Some(channel) = tracker.probe_channel(ip).await else {
                return ProbeOutcome::Missed;
            };
            let (reply, acked) = oneshot::channel();
            if channel.send(ProbeCommand { timeout, reply }).await.is_err() {
                return ProbeOutcome::Missed;
            }
            // The driver enforces the deadline; the outer timeout only
            // guards against a driver that died mid-probe.
            match tokio::time::timeout(timeout + Duration::from_secs(1), acked).await {
                Ok(Ok(true)) => ProbeOutcome::Acked,
                _ => ProbeOutcome::Missed,
            }
        }
    }
}
