//! Transport configuration.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which transport a channel or request uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// Listening side of a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelServerConfig {
    /// Interface to bind; unspecified binds all interfaces
    pub bind_ip: IpAddr,
    /// 0 picks an ephemeral port
    pub tcp_port: u16,
    /// 0 picks an ephemeral port
    pub udp_port: u16,
    /// Idle TCP connections are closed after this long without a message
    pub heartbeat_ms: u64,
    /// Advertise the peer as firewalled on both transports
    pub behind_firewall: bool,
    /// Skip address discovery and advertise this address
    pub external_address: Option<IpAddr>,
    /// Accept a loopback address when no other interface is usable
    pub allow_loopback: bool,
}

impl Default for ChannelServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: 7700,
            udp_port: 7700,
            heartbeat_ms: 30_000,
            behind_firewall: false,
            external_address: None,
            allow_loopback: false,
        }
    }
}

impl ChannelServerConfig {
    /// Loopback-only server on ephemeral ports.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tcp_port: 0,
            udp_port: 0,
            heartbeat_ms: 2_000,
            allow_loopback: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self.udp_port = port;
        self
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

// =============================================================================
// CLIENT
// =============================================================================

/// Outbound side of a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelClientConfig {
    /// Ceiling on concurrently in-use outbound channels; 0 is read as 1
    pub max_in_use_channels: usize,
    /// Idle channels kept per destination and transport
    pub max_idle_per_destination: usize,
    pub connect_timeout_ms: u64,
    /// Used when a caller does not pass its own timeout
    pub request_timeout_ms: u64,
    /// Local interface outbound sockets bind to
    pub bind_ip: IpAddr,
}

impl Default for ChannelClientConfig {
    fn default() -> Self {
        Self {
            max_in_use_channels: 64,
            max_idle_per_destination: 4,
            connect_timeout_ms: 3_000,
            request_timeout_ms: 5_000,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl ChannelClientConfig {
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_in_use_channels: 8,
            max_idle_per_destination: 2,
            connect_timeout_ms: 1_000,
            request_timeout_ms: 2_000,
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    /// In-use ceiling the reservation enforces. Never zero, otherwise no
    /// acquire could ever complete.
    pub fn in_use_ceiling(&self) -> usize {
        self.max_in_use_channels.max(1)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// =============================================================================
// PEER
// =============================================================================

/// Everything needed to create a master peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Network identifier; traffic carrying another id is dropped
    pub p2p_id: i32,
    /// Hex peer id; derived from the key pair or random when absent
    pub peer_id: Option<String>,
    pub server: ChannelServerConfig,
    pub client: ChannelClientConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            p2p_id: 1,
            peer_id: None,
            server: ChannelServerConfig::default(),
            client: ChannelClientConfig::default(),
        }
    }
}

impl PeerConfig {
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            p2p_id: 1,
            peer_id: None,
            server: ChannelServerConfig::for_testing(),
            client: ChannelClientConfig::for_testing(),
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.server = self.server.with_port(port);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: PeerConfig = toml::from_str(
            r#"
            p2p_id = 7

            [server]
            tcp_port = 4001
            udp_port = 4002

            [client]
            max_in_use_channels = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.p2p_id, 7);
        assert_eq!(config.server.tcp_port, 4001);
        assert_eq!(config.server.heartbeat(), Duration::from_secs(30));
        assert_eq!(config.client.max_in_use_channels, 3);
        assert_eq!(config.client.max_idle_per_destination, 4);
    }

    #[test]
    fn test_transport_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            transport: Transport,
        }
        let wrapper: Wrapper = toml::from_str("transport = \"tcp\"").unwrap();
        assert_eq!(wrapper.transport, Transport::Tcp);
        assert_eq!(Transport::Udp.to_string(), "udp");
    }

    #[test]
    fn test_zero_in_use_ceiling_reads_as_one() {
        let config: ChannelClientConfig = toml::from_str("max_in_use_channels = 0").unwrap();
        assert_eq!(config.max_in_use_channels, 0);
        assert_eq!(config.in_use_ceiling(), 1);
        assert_eq!(ChannelClientConfig::default().in_use_ceiling(), 64);
    }

    #[test]
    fn test_for_testing_uses_ephemeral_loopback() {
        let config = PeerConfig::for_testing();
        assert_eq!(config.server.tcp_port, 0);
        assert!(config.server.allow_loopback);
        assert!(config.server.bind_ip.is_loopback());
        assert_eq!(PeerConfig::for_testing().with_port(4001).server.udp_port, 4001);
    }
}
