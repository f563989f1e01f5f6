use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny,
}

/// Decides whether a peer may read the metrics endpoint.
#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn decide(&self, peer: SocketAddr) -> Access;
}

/// No gate at all.
pub struct AllowAll;

#[async_trait]
impl AccessGate for AllowAll {
    async fn decide(&self, _peer: SocketAddr) -> Access {
        Access::Allow
    }
}

/// Only lets in peers addressed from the tailnet ranges
/// (100.64.0.0/10 and fd7a:115c:a1e0::/48).
pub struct TailnetOnly;

impl TailnetOnly {
    fn is_tailnet(ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => Self::is_tailnet_v4(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Self::is_tailnet_v4(v4),
                None => Self::is_tailnet_v6(v6),
            },
        }
    }

    fn is_tailnet_v4(ip: Ipv4Addr) -> bool {
        let [a, b, _, _] = ip.octets();
        a == 100 && (b & 0b1100_0000) == 64
    }

    fn is_tailnet_v6(ip: Ipv6Addr) -> bool {
        let segments = ip.segments();
        segments[0] == 0xfd7a && segments[1] == 0x115c && segments[2] == 0xa1e0
    }
}

#[async_trait]
impl AccessGate for TailnetOnly {
    async fn decide(&self, peer: SocketAddr) -> Access {
        if Self::is_tailnet(peer.ip()) {
            Access::Allow
        } else {
            Access::Deny
        }
    }
}
