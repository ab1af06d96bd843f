//! # Bootstrap and Discovery
//!
//! Two real peers on loopback exchanging handshake requests.
//!
//! 1. **Discover**: peer B asks peer A how it sees B; A records B as reachable.
//! 2. **Pooled connections**: a TCP connection the responder closed while it
//!    sat idle is replaced, not reused.
//! 3. **Bootstrap**: a bootstrap to a dead address fails within the request
//!    timeout, and the same sender then bootstraps against a live peer.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use dht_connection::{ChannelClientConfig, ChannelServerConfig, PeerConfig, PeerCreator, Transport};
    use dht_rpc::{HandshakeRpc, PeerTracker, Reachability, RpcError};

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    struct Node {
        peer: PeerCreator,
        rpc: Arc<HandshakeRpc>,
        tracker: Arc<PeerTracker>,
    }

    async fn node(config: PeerConfig) -> Node {
        let peer = PeerCreator::master(config, None).await.unwrap();
        let tracker = Arc::new(PeerTracker::new());
        peer.peer_bean().status_listeners().add(tracker.clone());
        let rpc = HandshakeRpc::new(&peer);
        rpc.register().unwrap();
        Node { peer, rpc, tracker }
    }

    // =============================================================================
    // DISCOVERY
    // =============================================================================

    #[tokio::test]
    async fn test_discover_marks_requester_reachable() {
        let a = node(PeerConfig::for_testing().with_port(4001)).await;
        let b = node(PeerConfig::for_testing().with_port(4002)).await;
        let a_address = a.peer.peer_bean().server_address();
        assert_eq!(a_address.udp_addr().port(), 4001);

        let observed = b.rpc.discover(&a_address).await.unwrap();
        assert_eq!(observed.peer_id(), b.peer.peer_id());

        assert_eq!(
            a.tracker.reachability(&b.peer.peer_id()),
            Some(Reachability::Reachable)
        );
        let record = a.tracker.record(&b.peer.peer_id()).unwrap();
        assert_eq!(record.address.udp_addr().port(), 4002);
        assert!(b.tracker.is_reachable(&a.peer.peer_id()));

        b.peer.shutdown().await;
        a.peer.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_over_tcp_reuses_pooled_channel() {
        let a = node(PeerConfig::for_testing()).await;
        let b = node(PeerConfig::for_testing()).await;
        let target = a.peer.peer_bean().server_address();

        for _ in 0..3 {
            b.rpc.ping(&target, Transport::Tcp).await.unwrap();
        }
        let reservation = b.peer.connection_bean().reservation();
        assert_eq!(reservation.in_use_count(), 0);
        assert_eq!(reservation.idle_count(), 1);
        assert_eq!(a.peer.connection_bean().channel_server().connection_count(), 1);

        b.peer.shutdown().await;
        a.peer.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_after_server_heartbeat_closes_pooled_connection() {
        let a = node(PeerConfig {
            server: ChannelServerConfig {
                heartbeat_ms: 100,
                ..ChannelServerConfig::for_testing()
            },
            ..PeerConfig::for_testing()
        })
        .await;
        let b = node(PeerConfig::for_testing()).await;
        let target = a.peer.peer_bean().server_address();

        b.rpc.ping(&target, Transport::Tcp).await.unwrap();
        assert_eq!(b.peer.connection_bean().reservation().idle_count(), 1);

        // server side drops the idle connection, the client still pools it
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(a.peer.connection_bean().channel_server().connection_count(), 0);

        let responder = b.rpc.ping(&target, Transport::Tcp).await.unwrap();
        assert_eq!(responder.peer_id(), a.peer.peer_id());
        assert_eq!(
            b.tracker.reachability(&a.peer.peer_id()),
            Some(Reachability::Reachable)
        );
        assert_eq!(b.tracker.record(&a.peer.peer_id()).unwrap().failures, 0);

        b.peer.shutdown().await;
        a.peer.shutdown().await;
    }

    // =============================================================================
    // BOOTSTRAP
    // =============================================================================

    #[tokio::test]
    async fn test_failed_bootstrap_then_live_bootstrap() {
        let timeout = Duration::from_millis(500);
        let config = PeerConfig {
            client: ChannelClientConfig {
                request_timeout_ms: timeout.as_millis() as u64,
                ..ChannelClientConfig::for_testing()
            },
            ..PeerConfig::for_testing()
        };
        let c = node(config).await;
        let live = node(PeerConfig::for_testing()).await;

        let started = Instant::now();
        let err = c.rpc.bootstrap("127.0.0.1:3000".parse().unwrap()).await.unwrap_err();
        assert!(started.elapsed() < timeout + Duration::from_millis(250));
        assert!(err.is_unreachable(), "unexpected error: {err}");
        assert!(matches!(err, RpcError::Connection(_)));
        // a peer without an id is never tracked
        assert!(c.tracker.is_empty());

        let seed = live.peer.connection_bean().channel_server().udp_addr();
        let responder = c.rpc.bootstrap(seed).await.unwrap();
        assert_eq!(responder.peer_id(), live.peer.peer_id());
        assert!(c.tracker.is_reachable(&live.peer.peer_id()));

        c.peer.shutdown().await;
        live.peer.shutdown().await;
    }
}
