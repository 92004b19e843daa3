//! Peer address policy.
//!
//! The relay only serves devices on the local network. The policy is a
//! stateless predicate applied once per accepted socket, before any protocol
//! byte is read; a rejected peer is closed with no response so port scanners
//! learn nothing about the service.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Whether a peer address is allowed to use the relay
///
/// Accepts IPv4 private ranges (10/8, 172.16/12, 192.168/16), link-local
/// (169.254/16), and loopback (127/8); IPv6 link-local (`fe80::/10`) and
/// loopback (`::1`). Dual-stack listeners surface LAN IPv4 peers as
/// IPv4-mapped IPv6 addresses, which are unmapped before classification.
pub fn permits_peer(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => permits_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(mapped) => permits_v4(mapped),
            None => permits_v6(v6),
        },
    }
}

fn permits_v4(addr: Ipv4Addr) -> bool {
    addr.is_private() || addr.is_link_local() || addr.is_loopback()
}

fn permits_v6(addr: Ipv6Addr) -> bool {
    addr.is_loopback() || is_unicast_link_local(addr)
}

// fe80::/10
fn is_unicast_link_local(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_private_ranges_accepted() {
        for addr in [
            "10.0.0.1",
            "10.255.255.254",
            "172.16.0.1",
            "172.31.255.1",
            "192.168.0.1",
            "192.168.255.254",
        ] {
            assert!(permits_peer(v4(addr)), "{addr} should be permitted");
        }
    }

    #[test]
    fn test_link_local_and_loopback_accepted() {
        for addr in ["169.254.1.1", "169.254.254.254", "127.0.0.1", "127.1.2.3"] {
            assert!(permits_peer(v4(addr)), "{addr} should be permitted");
        }
    }

    #[test]
    fn test_public_addresses_rejected() {
        for addr in [
            "8.8.8.8",
            "1.1.1.1",
            "93.184.216.34",
            "172.15.0.1",
            "172.32.0.1",
            "11.0.0.1",
            "192.167.0.1",
        ] {
            assert!(!permits_peer(v4(addr)), "{addr} should be rejected");
        }
    }

    #[test]
    fn test_ipv6_loopback_and_link_local_accepted() {
        assert!(permits_peer("::1".parse().unwrap()));
        assert!(permits_peer("fe80::1".parse().unwrap()));
        assert!(permits_peer("fe80:0:0:0:aabb:ccff:fedd:eeff".parse().unwrap()));
        // febf:: is still inside fe80::/10
        assert!(permits_peer("febf::1".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_global_rejected() {
        assert!(!permits_peer("2001:4860:4860::8888".parse().unwrap()));
        assert!(!permits_peer("fec0::1".parse().unwrap()));
        assert!(!permits_peer("::".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_mapped_follow_v4_rules() {
        assert!(permits_peer("::ffff:192.168.1.20".parse().unwrap()));
        assert!(permits_peer("::ffff:10.1.2.3".parse().unwrap()));
        assert!(!permits_peer("::ffff:8.8.8.8".parse().unwrap()));
    }
}
