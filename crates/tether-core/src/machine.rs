//! Per-connection handshake state machine.
//!
//! The tunnel handshake is modeled as a pure transition function
//! `(state, event) -> (state, effects)` so the protocol logic is testable
//! without sockets. The async driver in [`crate::engine`] produces events
//! from the wire and executes the returned effects.

use crate::error::WireError;
use crate::wire::{CMD_CONNECT, DestAddr, Reply};

/// Connection negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the greeting frame
    AwaitingGreeting,
    /// Greeting done; waiting for request frames
    AwaitingRequest,
    /// Tunnel established; bytes are copied verbatim
    Forwarding,
    /// Terminal
    Closed,
}

/// Events produced by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A complete greeting frame arrived
    Greeting {
        /// Offered authentication methods (content is irrelevant)
        methods: Vec<u8>,
    },
    /// A complete request frame arrived
    Request {
        /// Command byte
        command: u8,
        /// Requested destination
        dest: DestAddr,
        /// Destination port
        port: u16,
    },
    /// The peer sent a heartbeat probe
    HeartbeatProbe,
    /// A frame could not be parsed
    Malformed(MalformedKind),
    /// The downstream CONNECT tunnel was accepted
    UpstreamEstablished,
    /// The downstream TCP connection failed
    UpstreamRefused,
    /// The downstream proxy answered the CONNECT with a non-200 status
    UpstreamRejected,
    /// Forwarding finished (either side closed)
    ForwardingDone {
        /// Bytes copied peer -> downstream
        sent: u64,
        /// Bytes copied downstream -> peer
        received: u64,
    },
    /// The peer closed the socket
    PeerClosed,
}

/// Classified parse failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedKind {
    /// Recoverable; answered with a general-failure reply
    Recoverable,
    /// Recoverable; answered with address-type-not-supported
    BadAddressType,
    /// Stream desynchronized; the socket must close
    Fatal,
}

impl From<&WireError> for MalformedKind {
    fn from(err: &WireError) -> Self {
        if err.is_fatal() {
            MalformedKind::Fatal
        } else if matches!(err, WireError::UnsupportedAddressType(_)) {
            MalformedKind::BadAddressType
        } else {
            MalformedKind::Recoverable
        }
    }
}

/// Effects for the driver to execute, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Write the no-auth method selection
    SendMethodSelection,
    /// Tell the lifecycle tracker a connection is established
    NotifyConnected,
    /// Write a reply frame
    SendReply(Reply),
    /// Write a heartbeat ack
    SendHeartbeatAck,
    /// Open the downstream tunnel for this destination
    OpenUpstream {
        /// Requested destination
        dest: DestAddr,
        /// Destination port
        port: u16,
    },
    /// Start the bidirectional copy loop
    BeginForwarding,
    /// Report forwarding totals to the lifecycle tracker
    ReportTraffic {
        /// Bytes peer -> downstream
        sent: u64,
        /// Bytes downstream -> peer
        received: u64,
    },
    /// Close the socket (and the downstream socket, if any)
    Close,
    /// Tell the lifecycle tracker the connection is gone
    NotifyDisconnected,
}

/// Advance the handshake
///
/// Pure: no I/O, no clocks. Unknown (state, event) pairings close the
/// connection, which is the safe default for a protocol driver.
pub fn step(state: HandshakeState, event: Event) -> (HandshakeState, Vec<Effect>) {
    use Effect::*;
    use HandshakeState::*;

    match (state, event) {
        // The method list content is ignored; no-auth is always selected.
        // Establishment is signaled now, with the destination still pending.
        (AwaitingGreeting, Event::Greeting { .. }) => (
            AwaitingRequest,
            vec![SendMethodSelection, NotifyConnected],
        ),
        (AwaitingGreeting, Event::Malformed(_) | Event::PeerClosed) => (Closed, vec![Close]),

        (AwaitingRequest, Event::Request { command, dest, port }) => {
            if command == CMD_CONNECT {
                (AwaitingRequest, vec![OpenUpstream { dest, port }])
            } else {
                // Connection stays open; clients may issue further requests
                (AwaitingRequest, vec![SendReply(Reply::CommandNotSupported)])
            }
        }
        (AwaitingRequest, Event::HeartbeatProbe) => (AwaitingRequest, vec![SendHeartbeatAck]),
        (AwaitingRequest, Event::Malformed(MalformedKind::Recoverable)) => (
            AwaitingRequest,
            vec![SendReply(Reply::GeneralFailure)],
        ),
        (AwaitingRequest, Event::Malformed(MalformedKind::BadAddressType)) => (
            AwaitingRequest,
            vec![SendReply(Reply::AddressTypeNotSupported)],
        ),
        (AwaitingRequest, Event::Malformed(MalformedKind::Fatal)) => {
            (Closed, vec![Close, NotifyDisconnected])
        }
        (AwaitingRequest, Event::UpstreamEstablished) => (
            Forwarding,
            vec![SendReply(Reply::Success), BeginForwarding],
        ),
        (AwaitingRequest, Event::UpstreamRefused) => (
            Closed,
            vec![SendReply(Reply::ConnectionRefused), Close, NotifyDisconnected],
        ),
        // Tunnel rejected: close both sides, no reply reaches the peer
        (AwaitingRequest, Event::UpstreamRejected) => (Closed, vec![Close, NotifyDisconnected]),
        (AwaitingRequest, Event::PeerClosed) => (Closed, vec![Close, NotifyDisconnected]),

        (Forwarding, Event::ForwardingDone { sent, received }) => (
            Closed,
            vec![ReportTraffic { sent, received }, Close, NotifyDisconnected],
        ),
        (Forwarding, Event::PeerClosed) => (Closed, vec![Close, NotifyDisconnected]),

        (Closed, _) => (Closed, vec![]),

        // Anything else is a driver bug or a protocol violation; close.
        (s, _) => {
            let effects = if s == AwaitingGreeting {
                vec![Close]
            } else {
                vec![Close, NotifyDisconnected]
            };
            (Closed, effects)
        }
    }
}
