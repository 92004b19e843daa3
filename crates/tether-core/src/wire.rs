//! Wire codec for the tunnel protocol.
//!
//! The client-facing protocol is SOCKS5-compatible framing: a greeting with
//! a method list, connect-style requests in three address encodings, fixed
//! ten-byte replies, and a three-byte heartbeat extension on the same
//! connection. All multi-byte fields are big-endian (network byte order).
//!
//! Readers in this module consume exactly one frame; on truncation they
//! report [`WireError::Truncated`], which is always fatal to the stream.

use crate::error::WireError;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Protocol version byte (SOCKS5)
pub const VERSION: u8 = 0x05;

/// "No authentication" method id, the only one the relay selects
pub const METHOD_NO_AUTH: u8 = 0x00;

/// Connect command, the only one the relay services
pub const CMD_CONNECT: u8 = 0x01;

/// Heartbeat opcode carried in the command slot of a three-byte probe frame
pub const HEARTBEAT_OPCODE: u8 = 0xFF;

/// Reserved byte value
pub const RESERVED: u8 = 0x00;

/// IPv4 address type (4 bytes)
pub const ATYP_IPV4: u8 = 0x01;
/// Domain address type (1-byte length prefix + bytes)
pub const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type (16 bytes)
pub const ATYP_IPV6: u8 = 0x04;

/// Reply codes sent to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    /// Request succeeded; forwarding begins after this reply
    Success = 0x00,
    /// Malformed field or other recoverable server-side failure
    GeneralFailure = 0x01,
    /// Downstream connection could not be established
    ConnectionRefused = 0x05,
    /// Command other than connect
    CommandNotSupported = 0x07,
    /// Unknown address-type byte
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Raw reply code
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Destination address in one of the three request encodings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestAddr {
    /// Four-byte IPv4 address
    Ipv4(Ipv4Addr),
    /// Length-prefixed domain name
    Domain(String),
    /// Sixteen-byte IPv6 address
    Ipv6(Ipv6Addr),
}

impl std::fmt::Display for DestAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DestAddr::Ipv4(addr) => write!(f, "{addr}"),
            DestAddr::Domain(name) => f.write_str(name),
            DestAddr::Ipv6(addr) => write!(f, "[{addr}]"),
        }
    }
}

/// One parsed request frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestFrame {
    /// `[ver, cmd, rsv, atyp, addr, port]` tunnel request
    ///
    /// `command` is preserved even when unsupported so the driver can answer
    /// with the right reply code while staying in sync with the stream.
    Tunnel {
        /// Command byte
        command: u8,
        /// Requested destination
        dest: DestAddr,
        /// Destination port
        port: u16,
    },
    /// `[ver, 0xFF, rsv]` heartbeat probe from the peer
    HeartbeatProbe,
}

/// Method-selection reply: no-auth, always
pub fn method_selection() -> [u8; 2] {
    [VERSION, METHOD_NO_AUTH]
}

/// Encode a ten-byte reply frame
///
/// The bound address/port fields are cosmetic zeroes; clients ignore them.
pub fn reply_frame(reply: Reply) -> [u8; 10] {
    [
        VERSION,
        reply.code(),
        RESERVED,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}

/// Three-byte heartbeat probe sent by the relay
pub fn heartbeat_probe() -> [u8; 3] {
    [VERSION, HEARTBEAT_OPCODE, RESERVED]
}

/// Two-byte heartbeat acknowledgment
pub fn heartbeat_ack() -> [u8; 2] {
    [VERSION, METHOD_NO_AUTH]
}

/// Read the greeting frame and return the offered method list
///
/// Reads exactly `[version, count, count * method]` bytes. The method
/// contents are returned unfiltered; the relay always selects no-auth
/// regardless of what was offered.
///
/// # Errors
///
/// [`WireError::BadVersion`] on a version mismatch, [`WireError::Truncated`]
/// if the peer closes mid-frame.
pub async fn read_greeting<R>(reader: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    read_frame_bytes(reader, &mut header).await?;

    if header[0] != VERSION {
        return Err(WireError::BadVersion(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    read_frame_bytes(reader, &mut methods).await?;
    Ok(methods)
}

/// Read the remainder of a request frame, version byte already consumed
///
/// The driver reads the leading byte itself (it selects between socket
/// readiness and probe commands), then hands the rest of the frame here.
///
/// # Errors
///
/// Fatal: [`WireError::BadVersion`], [`WireError::Truncated`]. Non-fatal
/// (stream stays in sync, caller replies and continues):
/// [`WireError::EmptyDomain`], [`WireError::BadDomainEncoding`],
/// [`WireError::UnsupportedAddressType`].
pub async fn read_request_after<R>(version: u8, reader: &mut R) -> Result<RequestFrame, WireError>
where
    R: AsyncRead + Unpin,
{
    if version != VERSION {
        return Err(WireError::BadVersion(version));
    }

    let mut rest = [0u8; 2];
    read_frame_bytes(reader, &mut rest).await?;
    let command = rest[0];

    // Heartbeat frames are three bytes with no address payload
    if command == HEARTBEAT_OPCODE {
        return Ok(RequestFrame::HeartbeatProbe);
    }

    let mut atyp = [0u8; 1];
    read_frame_bytes(reader, &mut atyp).await?;

    // Recoverable domain errors are deferred until after the port bytes are
    // consumed, so the stream stays parseable for the next frame.
    let dest = match atyp[0] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            read_frame_bytes(reader, &mut octets).await?;
            Ok(DestAddr::Ipv4(Ipv4Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_frame_bytes(reader, &mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            read_frame_bytes(reader, &mut name).await?;
            if name.is_empty() {
                Err(WireError::EmptyDomain)
            } else {
                String::from_utf8(name)
                    .map(DestAddr::Domain)
                    .map_err(|_| WireError::BadDomainEncoding)
            }
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            read_frame_bytes(reader, &mut octets).await?;
            Ok(DestAddr::Ipv6(Ipv6Addr::from(octets)))
        }
        other => return Err(WireError::UnsupportedAddressType(other)),
    };

    let mut port = [0u8; 2];
    read_frame_bytes(reader, &mut port).await?;
    let dest = dest?;

    Ok(RequestFrame::Tunnel {
        command,
        dest,
        port: u16::from_be_bytes(port),
    })
}

async fn read_frame_bytes<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    reader.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Truncated
        } else {
            WireError::Io(e)
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn request(bytes: &[u8]) -> Result<RequestFrame, WireError> {
        let mut reader = &bytes[1..];
        read_request_after(bytes[0], &mut reader).await
    }

    #[tokio::test]
    async fn test_greeting_reads_exact_method_count() {
        let frame = [0x05, 0x02, 0x00, 0x02, 0xAA];
        let mut reader = &frame[..];
        let methods = read_greeting(&mut reader).await.unwrap();
        assert_eq!(methods, vec![0x00, 0x02]);
        // The trailing byte belongs to the next frame
        assert_eq!(reader, &[0xAA]);
    }

    #[tokio::test]
    async fn test_greeting_zero_methods() {
        let frame = [0x05, 0x00];
        let mut reader = &frame[..];
        let methods = read_greeting(&mut reader).await.unwrap();
        assert!(methods.is_empty());
    }

    #[tokio::test]
    async fn test_greeting_bad_version() {
        let frame = [0x04, 0x01, 0x00];
        let mut reader = &frame[..];
        let err = read_greeting(&mut reader).await.unwrap_err();
        assert!(matches!(err, WireError::BadVersion(0x04)));
    }

    #[tokio::test]
    async fn test_greeting_truncated_method_list() {
        let frame = [0x05, 0x03, 0x00];
        let mut reader = &frame[..];
        let err = read_greeting(&mut reader).await.unwrap_err();
        assert!(matches!(err, WireError::Truncated));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_request_ipv4() {
        let frame = [0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB];
        let parsed = request(&frame).await.unwrap();
        assert_eq!(
            parsed,
            RequestFrame::Tunnel {
                command: CMD_CONNECT,
                dest: DestAddr::Ipv4(Ipv4Addr::new(93, 184, 216, 34)),
                port: 443,
            }
        );
    }

    #[tokio::test]
    async fn test_request_domain() {
        let mut frame = vec![0x05, 0x01, 0x00, 0x03, 0x0B];
        frame.extend_from_slice(b"example.com");
        frame.extend_from_slice(&[0x00, 0x50]);
        let parsed = request(&frame).await.unwrap();
        assert_eq!(
            parsed,
            RequestFrame::Tunnel {
                command: CMD_CONNECT,
                dest: DestAddr::Domain("example.com".to_string()),
                port: 80,
            }
        );
    }

    #[tokio::test]
    async fn test_request_ipv6() {
        let mut frame = vec![0x05, 0x01, 0x00, 0x04];
        frame.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        frame.extend_from_slice(&[0x1F, 0x90]);
        let parsed = request(&frame).await.unwrap();
        assert_eq!(
            parsed,
            RequestFrame::Tunnel {
                command: CMD_CONNECT,
                dest: DestAddr::Ipv6(Ipv6Addr::LOCALHOST),
                port: 8080,
            }
        );
    }

    #[tokio::test]
    async fn test_request_empty_domain_rejected() {
        let frame = [0x05, 0x01, 0x00, 0x03, 0x00, 0x00, 0x50];
        let err = request(&frame).await.unwrap_err();
        assert!(matches!(err, WireError::EmptyDomain));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_request_domain_shorter_than_declared() {
        let mut frame = vec![0x05, 0x01, 0x00, 0x03, 0x20];
        frame.extend_from_slice(b"short");
        let err = request(&frame).await.unwrap_err();
        assert!(matches!(err, WireError::Truncated));
    }

    #[tokio::test]
    async fn test_request_unknown_atyp() {
        let frame = [0x05, 0x01, 0x00, 0x02, 0x00, 0x50];
        let err = request(&frame).await.unwrap_err();
        assert!(matches!(err, WireError::UnsupportedAddressType(0x02)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_request_preserves_unsupported_command() {
        // BIND has the same frame shape; parse must stay in sync
        let frame = [0x05, 0x02, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x16];
        let parsed = request(&frame).await.unwrap();
        assert!(matches!(
            parsed,
            RequestFrame::Tunnel { command: 0x02, .. }
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_probe_frame() {
        let frame = [0x05, 0xFF, 0x00];
        let parsed = request(&frame).await.unwrap();
        assert_eq!(parsed, RequestFrame::HeartbeatProbe);
    }

    #[test]
    fn test_reply_frame_shape() {
        let frame = reply_frame(Reply::Success);
        assert_eq!(frame, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let refused = reply_frame(Reply::ConnectionRefused);
        assert_eq!(refused[1], 0x05);
        assert_eq!(refused.len(), 10);
    }

    #[test]
    fn test_reply_codes() {
        assert_eq!(Reply::Success.code(), 0x00);
        assert_eq!(Reply::GeneralFailure.code(), 0x01);
        assert_eq!(Reply::ConnectionRefused.code(), 0x05);
        assert_eq!(Reply::CommandNotSupported.code(), 0x07);
        assert_eq!(Reply::AddressTypeNotSupported.code(), 0x08);
    }

    #[test]
    fn test_heartbeat_frames() {
        assert_eq!(heartbeat_probe(), [0x05, 0xFF, 0x00]);
        assert_eq!(heartbeat_ack(), [0x05, 0x00]);
    }

    #[test]
    fn test_dest_addr_display() {
        assert_eq!(DestAddr::Ipv4(Ipv4Addr::new(10, 0, 0, 1)).to_string(), "10.0.0.1");
        assert_eq!(DestAddr::Domain("example.com".into()).to_string(), "example.com");
        assert_eq!(DestAddr::Ipv6(Ipv6Addr::LOCALHOST).to_string(), "[::1]");
    }
}
