//! # Peer Addresses
//!
//! `PeerSocketAddress` is one IP with a TCP and a UDP port. `PeerAddress`
//! binds a `PeerId` to such an endpoint plus reachability flags and the
//! relays that forward traffic for a firewalled peer.
//!
//! Both are immutable; the `change_*` methods return a modified copy.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::errors::TypesError;
use crate::peer_id::PeerId;

/// Maximum number of relays a peer advertises.
pub const MAX_RELAYS: usize = 5;

/// An IP address with separate TCP and UDP ports.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerSocketAddress {
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl PeerSocketAddress {
    #[must_use]
    pub const fn new(ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            ip,
            tcp_port,
            udp_port,
        }
    }

    /// Same port for both transports.
    #[must_use]
    pub const fn with_port(ip: IpAddr, port: u16) -> Self {
        Self::new(ip, port, port)
    }

    #[must_use]
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    #[must_use]
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }
}

impl Default for PeerSocketAddress {
    fn default() -> Self {
        Self::with_port(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }
}

impl fmt::Debug for PeerSocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(tcp:{},udp:{})", self.ip, self.tcp_port, self.udp_port)
    }
}

impl fmt::Display for PeerSocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything needed to contact a peer.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    peer_id: PeerId,
    socket: PeerSocketAddress,
    firewalled_tcp: bool,
    firewalled_udp: bool,
    relays: Vec<PeerSocketAddress>,
}

impl PeerAddress {
    #[must_use]
    pub fn new(peer_id: PeerId, socket: PeerSocketAddress) -> Self {
        Self {
            peer_id,
            socket,
            firewalled_tcp: false,
            firewalled_udp: false,
            relays: Vec::new(),
        }
    }

    /// Address of a peer whose identifier is not known yet, e.g. a bootstrap
    /// target given only as `ip:port`.
    #[must_use]
    pub fn unknown(addr: SocketAddr) -> Self {
        Self::new(
            PeerId::ZERO,
            PeerSocketAddress::with_port(addr.ip(), addr.port()),
        )
    }

    /// Rebuild an address from decoded parts. Fails on too many relays.
    pub fn from_parts(
        peer_id: PeerId,
        socket: PeerSocketAddress,
        firewalled_tcp: bool,
        firewalled_udp: bool,
        relays: Vec<PeerSocketAddress>,
    ) -> Result<Self, TypesError> {
        Self::new(peer_id, socket)
            .change_firewalled(firewalled_tcp, firewalled_udp)
            .with_relays(relays)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn socket(&self) -> PeerSocketAddress {
        self.socket
    }

    pub fn ip(&self) -> IpAddr {
        self.socket.ip
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.socket.tcp_addr()
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.socket.udp_addr()
    }

    pub fn is_firewalled_tcp(&self) -> bool {
        self.firewalled_tcp
    }

    pub fn is_firewalled_udp(&self) -> bool {
        self.firewalled_udp
    }

    pub fn is_firewalled(&self) -> bool {
        self.firewalled_tcp || self.firewalled_udp
    }

    pub fn relays(&self) -> &[PeerSocketAddress] {
        &self.relays
    }

    pub fn is_relayed(&self) -> bool {
        !self.relays.is_empty()
    }

    /// Copy with a different identifier; used to mint a child peer's address
    /// on its master's endpoint.
    #[must_use]
    pub fn change_peer_id(&self, peer_id: PeerId) -> Self {
        Self {
            peer_id,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn change_socket_address(&self, socket: PeerSocketAddress) -> Self {
        Self {
            socket,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn change_firewalled(&self, tcp: bool, udp: bool) -> Self {
        Self {
            firewalled_tcp: tcp,
            firewalled_udp: udp,
            ..self.clone()
        }
    }

    pub fn with_relays(&self, relays: Vec<PeerSocketAddress>) -> Result<Self, TypesError> {
        if relays.len() > MAX_RELAYS {
            return Err(TypesError::TooManyRelays {
                count: relays.len(),
                max: MAX_RELAYS,
            });
        }
        Ok(Self {
            relays,
            ..self.clone()
        })
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({:?}@{:?}", self.peer_id, self.socket)?;
        if self.is_firewalled() {
            write!(f, ",fw")?;
        }
        if self.is_relayed() {
            write!(f, ",relays={}", self.relays.len())?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer_id, self.socket)
    }
}
