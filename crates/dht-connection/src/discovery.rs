//! Outbound-interface discovery for a peer's own address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use tracing::debug;

use crate::config::ChannelServerConfig;
use crate::error::ConnectionError;

/// TEST-NET-1; never routed, only used to make the OS pick an interface.
const ROUTE_TARGET: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 9);

/// Resolve the IP other peers should use to reach this one.
///
/// Order: configured external address, a specific bind address, the
/// interface the OS would route outbound traffic through, then loopback
/// when allowed.
pub fn discover_address(config: &ChannelServerConfig) -> Result<IpAddr, ConnectionError> {
    if let Some(external) = config.external_address {
        debug!(%external, "Using configured external address");
        return Ok(external);
    }

    let bind = config.bind_ip;
    if !bind.is_unspecified() && (!bind.is_loopback() || config.allow_loopback) {
        return Ok(bind);
    }

    match outbound_interface() {
        Some(ip) => {
            debug!(%ip, "Discovered outbound interface");
            return Ok(ip);
        }
        None => debug!("No routable outbound interface"),
    }

    if config.allow_loopback {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    Err(ConnectionError::AddressDiscovery(format!(
        "bind address {bind} is not routable and no outbound interface was found"
    )))
}

// connect() on UDP sends nothing
fn outbound_interface() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(ROUTE_TARGET).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}
