//! Per-connection protocol driver.
//!
//! Each accepted socket gets one driver task. The driver produces events
//! from the wire, feeds them through the pure state machine in
//! [`crate::machine`], and executes the effects that come back: greeting
//! replies, lifecycle notifications, downstream CONNECT negotiation, raw
//! forwarding, and teardown.
//!
//! The driver is the only task that ever touches its socket. Heartbeat
//! probes are serviced on the monitor's behalf through a command channel:
//! the driver writes the probe frame, reads the ack with the monitor's
//! deadline, and reports the outcome back. Errors here never escape the
//! task; every exit path notifies the lifecycle tracker and closes both
//! sockets.

use crate::config::RelayConfig;
use crate::heartbeat::ProbeCommand;
use crate::machine::{Effect, Event, HandshakeState, MalformedKind, step};
use crate::tracker::DeviceTracker;
use crate::wire::{self, RequestFrame};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

const CONNECT_RESPONSE_LIMIT: usize = 8192;

/// Serve one accepted connection until it closes
///
/// The peer has already passed the address policy. This future is the
/// connection's task; cancelling it closes the socket and the tracker
/// learns about the disconnect from the next lifecycle sweep of its
/// shutdown signal.
pub async fn serve_connection<S>(
    stream: S,
    peer_ip: IpAddr,
    tracker: DeviceTracker,
    config: Arc<RelayConfig>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (probe_tx, probe_rx) = mpsc::channel(4);
    let driver = Driver {
        stream,
        peer_ip,
        tracker,
        config,
        upstream: None,
        probe_tx,
        probe_rx,
        shutdown: None,
    };
    driver.run().await;
}

struct Driver<S> {
    stream: S,
    peer_ip: IpAddr,
    tracker: DeviceTracker,
    config: Arc<RelayConfig>,
    upstream: Option<TcpStream>,
    probe_tx: mpsc::Sender<ProbeCommand>,
    probe_rx: mpsc::Receiver<ProbeCommand>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn run(mut self) {
        let mut state = HandshakeState::AwaitingGreeting;
        let mut pending: VecDeque<Event> = VecDeque::new();

        while state != HandshakeState::Closed {
            let event = match pending.pop_front() {
                Some(event) => event,
                None => self.next_event(state).await,
            };
            let (next, effects) = step(state, event);
            state = next;
            for effect in effects {
                if let Some(follow) = self.apply(effect).await {
                    pending.push_back(follow);
                }
            }
        }
    }

    async fn next_event(&mut self, state: HandshakeState) -> Event {
        match state {
            HandshakeState::AwaitingGreeting => self.read_greeting_event().await,
            HandshakeState::AwaitingRequest => self.read_request_event().await,
            // Forwarding resolves through its own effect; Closed exits the loop
            _ => Event::PeerClosed,
        }
    }

    async fn read_greeting_event(&mut self) -> Event {
        match timeout(
            self.config.handshake_timeout,
            wire::read_greeting(&mut self.stream),
        )
        .await
        {
            Ok(Ok(methods)) => Event::Greeting { methods },
            Ok(Err(e)) => {
                tracing::debug!(peer = %self.peer_ip, error = %e, "greeting rejected");
                Event::Malformed(MalformedKind::Fatal)
            }
            Err(_) => {
                tracing::debug!(peer = %self.peer_ip, "greeting stalled");
                Event::PeerClosed
            }
        }
    }

    /// Wait for the next request frame, servicing probes in between
    ///
    /// The leading byte is read with a cancel-safe single-byte read so the
    /// select can also wake on probe commands and the force-close signal.
    async fn read_request_event(&mut self) -> Event {
        loop {
            let mut first = [0u8; 1];
            let shutdown = self
                .shutdown
                .as_mut()
                .expect("established before entering request state");

            tokio::select! {
                _ = shutdown.changed() => return Event::PeerClosed,
                command = self.probe_rx.recv() => {
                    if let Some(command) = command {
                        let acked = probe_roundtrip(&mut self.stream, command.timeout).await;
                        let _ = command.reply.send(acked);
                    }
                    continue;
                }
                read = self.stream.read(&mut first) => match read {
                    Ok(0) => return Event::PeerClosed,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(peer = %self.peer_ip, error = %e, "request read failed");
                        return Event::PeerClosed;
                    }
                },
            }

            let frame = timeout(
                self.config.handshake_timeout,
                wire::read_request_after(first[0], &mut self.stream),
            )
            .await;

            return match frame {
                Ok(Ok(RequestFrame::Tunnel { command, dest, port })) => {
                    Event::Request { command, dest, port }
                }
                Ok(Ok(RequestFrame::HeartbeatProbe)) => Event::HeartbeatProbe,
                Ok(Err(e)) => {
                    tracing::debug!(peer = %self.peer_ip, error = %e, "malformed request");
                    Event::Malformed(MalformedKind::from(&e))
                }
                Err(_) => {
                    tracing::debug!(peer = %self.peer_ip, "request frame stalled");
                    Event::Malformed(MalformedKind::Fatal)
                }
            };
        }
    }

    async fn apply(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::SendMethodSelection => self.write(&wire::method_selection()).await,
            Effect::SendReply(reply) => self.write(&wire::reply_frame(reply)).await,
            Effect::SendHeartbeatAck => self.write(&wire::heartbeat_ack()).await,
            Effect::NotifyConnected => {
                let established = self.tracker.connection_established(self.peer_ip).await;
                self.shutdown = Some(established.shutdown);
                self.tracker
                    .register_probe_channel(self.peer_ip, self.probe_tx.clone())
                    .await;
                None
            }
            Effect::OpenUpstream { dest, port } => Some(self.open_upstream(&format!("{dest}:{port}")).await),
            Effect::BeginForwarding => {
                // This connection is a tunnel now; probes need a control
                // connection, which this one no longer is.
                self.tracker
                    .clear_probe_channel(self.peer_ip, &self.probe_tx)
                    .await;
                Some(self.forward().await)
            }
            Effect::ReportTraffic { sent, received } => {
                self.tracker.traffic_update(self.peer_ip, sent, received).await;
                None
            }
            Effect::Close => {
                self.upstream = None;
                let _ = self.stream.shutdown().await;
                None
            }
            Effect::NotifyDisconnected => {
                self.tracker
                    .clear_probe_channel(self.peer_ip, &self.probe_tx)
                    .await;
                self.tracker.connection_closed(self.peer_ip).await;
                None
            }
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Option<Event> {
        match self.stream.write_all(bytes).await {
            Ok(()) => None,
            Err(e) => {
                tracing::debug!(peer = %self.peer_ip, error = %e, "write failed");
                Some(Event::PeerClosed)
            }
        }
    }

    /// Open the downstream tunnel for `authority` (the peer's destination)
    ///
    /// The TCP connection goes to the configured inspection proxy; the
    /// destination travels inside the CONNECT request line.
    async fn open_upstream(&mut self, authority: &str) -> Event {
        let upstream_addr = (
            self.config.upstream.host.as_str(),
            self.config.upstream.port,
        );
        let connected = timeout(
            self.config.upstream.connect_timeout,
            TcpStream::connect(upstream_addr),
        )
        .await;

        let mut upstream = match connected {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(e)) => {
                tracing::warn!(
                    proxy = %self.config.upstream.authority(),
                    error = %e,
                    "downstream proxy unreachable"
                );
                return Event::UpstreamRefused;
            }
            Err(_) => {
                tracing::warn!(
                    proxy = %self.config.upstream.authority(),
                    "downstream proxy connect timed out"
                );
                return Event::UpstreamRefused;
            }
        };

        match negotiate_connect(&mut upstream, authority, self.config.upstream.connect_timeout)
            .await
        {
            Ok(true) => {
                tracing::debug!(peer = %self.peer_ip, destination = authority, "tunnel established");
                self.tracker
                    .destination_update(self.peer_ip, authority.to_string())
                    .await;
                self.upstream = Some(upstream);
                Event::UpstreamEstablished
            }
            Ok(false) => {
                tracing::warn!(destination = authority, "downstream proxy rejected tunnel");
                Event::UpstreamRejected
            }
            Err(e) => {
                tracing::warn!(destination = authority, error = %e, "tunnel negotiation failed");
                Event::UpstreamRejected
            }
        }
    }

    /// Copy bytes both ways until either side closes
    async fn forward(&mut self) -> Event {
        let Some(mut upstream) = self.upstream.take() else {
            return Event::ForwardingDone {
                sent: 0,
                received: 0,
            };
        };

        let copied = {
            let shutdown = self
                .shutdown
                .as_mut()
                .expect("established before forwarding");
            tokio::select! {
                result = tokio::io::copy_bidirectional(&mut self.stream, &mut upstream) => result,
                _ = shutdown.changed() => {
                    tracing::debug!(peer = %self.peer_ip, "forwarding cancelled");
                    Ok((0, 0))
                }
            }
        };

        match copied {
            Ok((sent, received)) => Event::ForwardingDone { sent, received },
            Err(e) => {
                tracing::debug!(peer = %self.peer_ip, error = %e, "forwarding ended with error");
                Event::ForwardingDone {
                    sent: 0,
                    received: 0,
                }
            }
        }
    }
}

/// Write a probe frame and await the two-byte ack
async fn probe_roundtrip<S>(stream: &mut S, deadline: Duration) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if stream.write_all(&wire::heartbeat_probe()).await.is_err() {
        return false;
    }
    let mut ack = [0u8; 2];
    match timeout(deadline, stream.read_exact(&mut ack)).await {
        Ok(Ok(_)) => ack == wire::heartbeat_ack(),
        _ => false,
    }
}

/// Negotiate the HTTP CONNECT tunnel with the inspection proxy
///
/// Returns whether the response status line contains "200". Reads at most
/// one header block; anything after the blank line belongs to the tunnel.
async fn negotiate_connect(
    upstream: &mut TcpStream,
    authority: &str,
    deadline: Duration,
) -> std::io::Result<bool> {
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    upstream.write_all(request.as_bytes()).await?;

    let response = timeout(deadline, read_header_block(upstream)).await;
    let response = match response {
        Ok(result) => result?,
        Err(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "proxy response timed out",
            ));
        }
    };

    let status_line = response.lines().next().unwrap_or_default();
    Ok(status_line.contains("200"))
}

async fn read_header_block(upstream: &mut TcpStream) -> std::io::Result<String> {
    let mut collected = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let n = upstream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&chunk[..n]);
        if collected.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if collected.len() > CONNECT_RESPONSE_LIMIT {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&collected).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::pairing::PairingStore;
    use crate::store::{ConnectionStore, MemoryConnectionStore};
    use crate::tracker::TrackerEvent;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    struct Fixture {
        tracker: DeviceTracker,
        store: Arc<MemoryConnectionStore>,
        _notifications: mpsc::UnboundedReceiver<TrackerEvent>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryConnectionStore::new());
        let pairing = Arc::new(PairingStore::open(dir.path().join("pairings.json")).unwrap());
        let (tx, notifications) = mpsc::unbounded_channel();
        let tracker = DeviceTracker::new(
            EventBus::new(),
            tx,
            store.clone() as Arc<dyn ConnectionStore>,
            pairing,
            "testfp",
            Duration::from_secs(30),
        );
        Fixture {
            tracker,
            store,
            _notifications: notifications,
            _dir: dir,
        }
    }

    fn peer() -> IpAddr {
        "192.168.1.20".parse().unwrap()
    }

    fn spawn_driver(fx: &Fixture, config: RelayConfig) -> tokio::io::DuplexStream {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_connection(
            server,
            peer(),
            fx.tracker.clone(),
            Arc::new(config),
        ));
        client
    }

    async fn greet(client: &mut tokio::io::DuplexStream) {
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    /// Accepts one connection, checks the CONNECT line, answers `status`,
    /// then echoes the tunnel bytes.
    async fn fake_proxy(expected_authority: &'static str, status: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            assert!(
                request.starts_with(&format!("CONNECT {expected_authority} HTTP/1.1\r\n")),
                "unexpected request: {request}"
            );
            assert!(request.contains(&format!("Host: {expected_authority}\r\n")));
            socket.write_all(status.as_bytes()).await.unwrap();
            if status.contains("200") {
                // Echo the tunnel payload back
                let mut tunnel = vec![0u8; 1024];
                loop {
                    match socket.read(&mut tunnel).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&tunnel[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn test_greeting_and_device_registration() {
        let fx = fixture();
        let mut client = spawn_driver(&fx, RelayConfig::default());

        greet(&mut client).await;

        // Establishment is signaled with the destination still pending
        tokio::task::yield_now().await;
        let set = fx.tracker.snapshot().await;
        assert_eq!(set.len(), 1);
        assert!(set[0].destination.is_none());
    }

    #[tokio::test]
    async fn test_bad_greeting_version_closes_without_tracking() {
        let fx = fixture();
        let mut client = spawn_driver(&fx, RelayConfig::default());

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(fx.tracker.device_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsupported_command_keeps_connection_usable() {
        let fx = fixture();
        let mut client = spawn_driver(&fx, RelayConfig::default());
        greet(&mut client).await;

        // BIND request
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x07);

        // Still open: an empty-domain request draws a general failure
        client
            .write_all(&[0x05, 0x01, 0x00, 0x03, 0x00, 0x00, 0x50])
            .await
            .unwrap();
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x01);
    }

    #[tokio::test]
    async fn test_peer_probe_is_acked() {
        let fx = fixture();
        let mut client = spawn_driver(&fx, RelayConfig::default());
        greet(&mut client).await;

        client.write_all(&[0x05, 0xFF, 0x00]).await.unwrap();
        let mut ack = [0u8; 2];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_probe_command_roundtrip_through_driver() {
        let fx = fixture();
        let mut client = spawn_driver(&fx, RelayConfig::default());
        greet(&mut client).await;

        // Client side: answer the probe frame with an ack
        let answer = tokio::spawn(async move {
            let mut probe = [0u8; 3];
            client.read_exact(&mut probe).await.unwrap();
            assert_eq!(probe, [0x05, 0xFF, 0x00]);
            client.write_all(&[0x05, 0x00]).await.unwrap();
            client
        });

        tokio::task::yield_now().await;
        let channel = fx.tracker.probe_channel(peer()).await.expect("registered");
        let (reply, acked) = tokio::sync::oneshot::channel();
        channel
            .send(ProbeCommand {
                timeout: Duration::from_secs(5),
                reply,
            })
            .await
            .unwrap();
        assert!(acked.await.unwrap());
        drop(answer.await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_with_dead_proxy_is_refused() {
        let fx = fixture();
        // Grab a port that nothing listens on
        let dead_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = RelayConfig::default();
        config.upstream.host = "127.0.0.1".to_string();
        config.upstream.port = dead_port;

        let mut client = spawn_driver(&fx, config);
        greet(&mut client).await;

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x05);

        // And the socket closes
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_tunnel_accepted_then_forwards() {
        let fx = fixture();
        let port = fake_proxy(
            "93.184.216.34:443",
            "HTTP/1.1 200 Connection established\r\n\r\n",
        )
        .await;
        let mut config = RelayConfig::default();
        config.upstream.port = port;

        let mut client = spawn_driver(&fx, config);
        greet(&mut client).await;

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        // Raw bytes flow both ways through the echoing proxy
        client.write_all(b"tunnel payload").await.unwrap();
        let mut echoed = [0u8; 14];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"tunnel payload");

        // Destination is no longer pending
        let set = fx.tracker.snapshot().await;
        assert_eq!(set[0].destination.as_deref(), Some("93.184.216.34:443"));
    }

    #[tokio::test]
    async fn test_connect_tunnel_rejected_closes_both_sides() {
        let fx = fixture();
        let port = fake_proxy("93.184.216.34:443", "HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
        let mut config = RelayConfig::default();
        config.upstream.port = port;

        let mut client = spawn_driver(&fx, config);
        greet(&mut client).await;

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB])
            .await
            .unwrap();

        // No success reply; the socket just closes
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_traffic_totals_reach_the_store() {
        let fx = fixture();
        let port = fake_proxy(
            "10.0.0.9:80",
            "HTTP/1.1 200 Connection established\r\n\r\n",
        )
        .await;
        let mut config = RelayConfig::default();
        config.upstream.port = port;

        let mut client = spawn_driver(&fx, config);
        greet(&mut client).await;
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 9, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        drop(client);

        // Wait for the driver to report and close
        tokio::time::sleep(Duration::from_millis(50)).await;
        let records = fx.store.fetch_recent(1);
        assert_eq!(records[0].bytes_sent, 4);
        assert_eq!(records[0].bytes_received, 4);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_tracker() {
        let fx = fixture();
        let mut client = spawn_driver(&fx, RelayConfig::default());
        greet(&mut client).await;

        tokio::task::yield_now().await;
        assert_eq!(fx.tracker.device_count().await, 1);

        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let set = fx.tracker.snapshot().await;
        assert_eq!(set[0].liveness, crate::events::Liveness::PendingRemoval);
    }
}
