//! Resolved candidate destinations and their address-family classification.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::peers::PeerId;

/// The address family of a resolved destination.
///
/// IPv4-mapped IPv6 addresses classify as [`AddrFamily::V4`]: the wire
/// protocol spoken over such a socket is IPv4, and treating them as IPv6
/// would defeat spare selection between the two stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum AddrFamily {
    /// IPv4.
    #[display("v4")]
    V4,
    /// IPv6.
    #[display("v6")]
    V6,
}

impl AddrFamily {
    /// Classifies a socket address. Pure, no allocation.
    pub fn of(addr: &SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(_) => AddrFamily::V4,
            IpAddr::V6(ip) if ip.to_ipv4_mapped().is_some() => AddrFamily::V4,
            IpAddr::V6(_) => AddrFamily::V6,
        }
    }

    /// The alternate stack, used when hunting for spare candidates.
    pub fn other(self) -> Self {
        match self {
            AddrFamily::V4 => AddrFamily::V6,
            AddrFamily::V6 => AddrFamily::V4,
        }
    }
}

/// The logical next hop a destination belongs to.
///
/// This is an opaque identity: the path-tracking code only ever compares it,
/// it never looks inside the peer's configuration. Resolve a [`PeerId`]
/// through the registry when configuration is actually needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum PeerRef {
    /// Going directly to the origin server.
    #[display("origin")]
    Origin,
    /// Going through the configured cache peer with this id.
    #[display("{_0}")]
    Peer(PeerId),
}

/// One resolved network path: a concrete address for reaching a peer or the
/// origin server.
///
/// Immutable once created. Two destinations "belong together" for prime/spare
/// selection when they carry the same [`PeerRef`]; the address family is
/// always derived from the address on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    peer: PeerRef,
    addr: SocketAddr,
}

impl Destination {
    /// A destination reaching `peer` at `addr`.
    pub fn new(peer: PeerRef, addr: SocketAddr) -> Self {
        Self { peer, addr }
    }

    /// A destination going straight to the origin server at `addr`.
    pub fn origin(addr: SocketAddr) -> Self {
        Self::new(PeerRef::Origin, addr)
    }

    /// A destination going through cache peer `id` at `addr`.
    pub fn via_peer(id: PeerId, addr: SocketAddr) -> Self {
        Self::new(PeerRef::Peer(id), addr)
    }

    /// The concrete address to dial.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The peer identity this path belongs to.
    pub fn peer(&self) -> PeerRef {
        self.peer
    }

    /// The address family, derived from the address.
    pub fn family(&self) -> AddrFamily {
        AddrFamily::of(&self.addr)
    }

    /// Whether both destinations lead to the same logical peer.
    pub fn same_peer(&self, other: &Destination) -> bool {
        self.peer == other.peer
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn family_classification() {
        assert_eq!(AddrFamily::of(&sa("10.0.0.1:3128")), AddrFamily::V4);
        assert_eq!(AddrFamily::of(&sa("[2001:db8::1]:3128")), AddrFamily::V6);
        assert_eq!(AddrFamily::of(&sa("[::1]:3128")), AddrFamily::V6);
        // IPv4-mapped IPv6 talks IPv4 on the wire
        assert_eq!(AddrFamily::of(&sa("[::ffff:10.0.0.1]:3128")), AddrFamily::V4);
    }

    #[test]
    fn peer_identity_matching() {
        let a = Destination::origin(sa("10.0.0.1:80"));
        let b = Destination::origin(sa("[2001:db8::1]:80"));
        let c = Destination::via_peer(PeerId::from_raw(1), sa("10.0.0.1:80"));
        assert!(a.same_peer(&b));
        assert!(!a.same_peer(&c));
    }

    #[test]
    fn display() {
        let d = Destination::origin(sa("10.0.0.1:80"));
        assert_eq!(d.to_string(), "origin/10.0.0.1:80");
        let d = Destination::via_peer(PeerId::from_raw(7), sa("[::1]:3128"));
        assert_eq!(d.to_string(), "peer7/[::1]:3128");
    }
}
