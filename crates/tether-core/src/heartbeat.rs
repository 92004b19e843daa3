//! Heartbeat health monitoring.
//!
//! One monitor task runs per active session. Each round sends a three-byte
//! probe over the device's control connection and waits for the two-byte
//! ack; a miss is retried after a short delay, and three consecutive misses
//! emit a single terminal timeout event and stop the monitor. Probe rounds
//! for one session are strictly sequential: a new probe is never in flight
//! while the previous one is unresolved.
//!
//! The monitor never touches a socket itself; it reaches the wire through a
//! [`ProbeTransport`], which in production is the engine driver's command
//! channel (the driver owns the socket) and in tests a scripted fake.

use crate::config::HeartbeatConfig;
use crate::store::{ConnectionId, ConnectionStore, ConnectionUpdate, DeviceId, LinkQuality};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Client application state, supplied out of band
///
/// Drives the probe cadence; when the client never reports a state the
/// foreground cadence applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppState {
    /// Client is foreground-active
    #[default]
    Foreground,
    /// Client is backgrounded
    Background,
}

/// Result of one probe round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The ack arrived within the deadline
    Acked,
    /// No ack within the deadline, or no way to reach the device
    Missed,
}

/// How a monitor reaches the wire
pub trait ProbeTransport: Send + 'static {
    /// Send one probe and await its ack
    ///
    /// Must resolve within roughly `timeout`; the monitor trusts the
    /// transport to enforce the deadline.
    fn probe(&mut self, timeout: Duration) -> impl Future<Output = ProbeOutcome> + Send;
}

/// A probe request handed to the engine driver
///
/// The driver writes the probe frame, reads the ack with the given
/// deadline, and answers on `reply`. A dropped `reply` counts as a miss.
#[derive(Debug)]
pub struct ProbeCommand {
    /// Ack deadline
    pub timeout: Duration,
    /// `true` if a well-formed ack arrived in time
    pub reply: oneshot::Sender<bool>,
}

/// Health events emitted by monitors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// A probe round succeeded
    Healthy {
        /// Monitored device
        device_id: DeviceId,
        /// Quality after the round
        quality: LinkQuality,
    },
    /// A probe round was missed, below the termination threshold
    Missed {
        /// Monitored device
        device_id: DeviceId,
        /// Consecutive misses so far
        failures: u32,
    },
    /// Terminal: the session must be torn down. Emitted exactly once.
    TimedOut {
        /// Monitored device
        device_id: DeviceId,
        /// Session record
        connection_id: ConnectionId,
    },
}

/// Control handle for a spawned monitor
pub struct HeartbeatHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Cancel the monitor
    ///
    /// Safe at any point; the periodic timer dies with the task.
    pub fn stop(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

/// Per-session heartbeat monitor
pub struct HeartbeatMonitor<T: ProbeTransport> {
    config: HeartbeatConfig,
    device_id: DeviceId,
    connection_id: ConnectionId,
    transport: T,
    store: Arc<dyn ConnectionStore>,
    app_state: watch::Receiver<AppState>,
    events: mpsc::UnboundedSender<HeartbeatEvent>,
}

impl<T: ProbeTransport> HeartbeatMonitor<T> {
    /// Create a monitor for one session
    pub fn new(
        config: HeartbeatConfig,
        device_id: DeviceId,
        connection_id: ConnectionId,
        transport: T,
        store: Arc<dyn ConnectionStore>,
        app_state: watch::Receiver<AppState>,
        events: mpsc::UnboundedSender<HeartbeatEvent>,
    ) -> Self {
        Self {
            config,
            device_id,
            connection_id,
            transport,
            store,
            app_state,
            events,
        }
    }

    /// Spawn the monitor loop
    pub fn spawn(self) -> HeartbeatHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        HeartbeatHandle { shutdown, task }
    }

    fn cadence(&self) -> Duration {
        match *self.app_state.borrow() {
            AppState::Foreground => self.config.active_interval,
            AppState::Background => self.config.background_interval,
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;
        let mut ever_failed = false;
        // Set once two consecutive misses accumulate; quality then only
        // heals to Degraded on the next success, and fully on the one after.
        let mut crossed = false;
        let mut delay = self.cadence();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            self.tolerate(self.store.update(
                &self.connection_id,
                ConnectionUpdate::HeartbeatSent { at: Utc::now() },
            ));

            match self.transport.probe(self.config.response_timeout).await {
                ProbeOutcome::Acked => {
                    failures = 0;
                    let quality = if crossed {
                        crossed = false;
                        LinkQuality::Degraded
                    } else if ever_failed {
                        LinkQuality::Good
                    } else {
                        LinkQuality::Excellent
                    };
                    self.tolerate(self.store.update(
                        &self.connection_id,
                        ConnectionUpdate::HeartbeatResult {
                            failures,
                            quality,
                            received_at: Some(Utc::now()),
                        },
                    ));
                    let _ = self.events.send(HeartbeatEvent::Healthy {
                        device_id: self.device_id.clone(),
                        quality,
                    });
                    delay = self.cadence();
                }
                ProbeOutcome::Missed => {
                    failures += 1;
                    ever_failed = true;
                    if failures >= 2 {
                        crossed = true;
                    }
                    let quality = quality_for_failures(failures);
                    self.tolerate(self.store.update(
                        &self.connection_id,
                        ConnectionUpdate::HeartbeatResult {
                            failures,
                            quality,
                            received_at: None,
                        },
                    ));

                    if failures >= self.config.max_failures {
                        tracing::warn!(
                            device = %self.device_id,
                            connection = %self.connection_id,
                            failures,
                            "heartbeat timed out, tearing session down"
                        );
                        self.tolerate(self.store.terminate(&self.connection_id));
                        let _ = self.events.send(HeartbeatEvent::TimedOut {
                            device_id: self.device_id.clone(),
                            connection_id: self.connection_id.clone(),
                        });
                        break;
                    }

                    tracing::debug!(
                        device = %self.device_id,
                        failures,
                        "heartbeat missed, retrying"
                    );
                    let _ = self.events.send(HeartbeatEvent::Missed {
                        device_id: self.device_id.clone(),
                        failures,
                    });
                    delay = self.config.retry_delay;
                }
            }
        }
    }

    fn tolerate(&self, result: Result<(), crate::error::StoreError>) {
        if let Err(e) = result {
            tracing::warn!(connection = %self.connection_id, error = %e, "store update skipped");
        }
    }
}

fn quality_for_failures(failures: u32) -> LinkQuality {
    match failures {
        0 => LinkQuality::Good,
        1 => LinkQuality::Fair,
        2 => LinkQuality::Poor,
        _ => LinkQuality::Degraded,
    }
}
