//! # Cascading Shutdown
//!
//! A master with children shares one transport. Shutting the master down
//! must unregister every child before the shared timer, reservation and
//! channel server go away, and must release those exactly once however many
//! peers are told to shut down.
//!
//! Ordering is checked from inside a pooled channel's close observer, so the
//! assertion sees the registry as it was when the reservation let go.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use dht_connection::{ConnectionError, MaintenanceTask, PeerConfig, PeerCreator, Transport};
    use dht_rpc::HandshakeRpc;
    use dht_types::PeerId;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    async fn master_with_children(count: usize) -> (PeerCreator, Vec<PeerCreator>) {
        let master = PeerCreator::master(PeerConfig::for_testing(), None).await.unwrap();
        HandshakeRpc::new(&master).register().unwrap();
        let children = (0..count)
            .map(|_| {
                let child = master.child(PeerId::random(), None).unwrap();
                HandshakeRpc::new(&child).register().unwrap();
                child
            })
            .collect();
        (master, children)
    }

    // =============================================================================
    // CASCADE
    // =============================================================================

    #[tokio::test]
    async fn test_master_shutdown_cascades_to_children() {
        let (master, children) = master_with_children(2).await;
        let bean = Arc::clone(master.connection_bean());

        // a child's maintenance job sees every peer registered
        let observed: Arc<Mutex<Option<usize>>> = Arc::new(Mutex::new(None));
        {
            let watched = Arc::clone(&bean);
            let observed = Arc::clone(&observed);
            let task = MaintenanceTask::start(bean.timer(), "watch", Duration::from_millis(5), move || {
                let watched = Arc::clone(&watched);
                let observed = Arc::clone(&observed);
                async move {
                    *observed.lock() = Some(watched.dispatcher().registered_keys().len());
                }
            })
            .unwrap();
            children[0].peer_bean().set_maintenance_task(task);
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*observed.lock(), Some(3));

        master.shutdown().await;

        assert!(bean.dispatcher().registered_keys().is_empty());
        assert!(children.iter().all(PeerCreator::is_shut_down));
        assert!(!children[0].peer_bean().has_maintenance_task());
        assert!(bean.timer().is_shut_down());
        assert!(bean.reservation().is_shut_down());
        assert!(bean.channel_server().is_shut_down());
    }

    #[tokio::test]
    async fn test_handlers_are_gone_when_pooled_channel_closes() {
        let (master, _children) = master_with_children(2).await;
        let bean = Arc::clone(master.connection_bean());

        let reserved = bean
            .reservation()
            .acquire(bean.channel_server().udp_addr(), Transport::Udp)
            .await
            .unwrap();

        // (registered keys, timer stopped, channel server stopped) at close time
        let seen: Arc<Mutex<Vec<(usize, bool, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let bean = Arc::clone(&bean);
            let seen = Arc::clone(&seen);
            reserved.channel().on_closed(move |_| {
                seen.lock().push((
                    bean.dispatcher().registered_keys().len(),
                    bean.timer().is_shut_down(),
                    bean.channel_server().is_shut_down(),
                ));
            });
        }
        assert!(seen.lock().is_empty());

        master.shutdown().await;

        assert_eq!(*seen.lock(), vec![(0, true, false)]);
        reserved.release(false);
    }

    #[tokio::test]
    async fn test_shared_resources_released_once() {
        let (master, children) = master_with_children(2).await;
        let bean = Arc::clone(master.connection_bean());

        let reserved = bean
            .reservation()
            .acquire(bean.channel_server().udp_addr(), Transport::Udp)
            .await
            .unwrap();
        let pooled = Arc::clone(reserved.channel());

        tokio::join!(
            children[0].shutdown(),
            master.shutdown(),
            children[1].shutdown(),
            master.shutdown(),
        );
        children[0].shutdown().await;
        master.shutdown().await;

        assert!(!pooled.is_open());
        reserved.release(true);
        assert_eq!(bean.reservation().idle_count(), 0);

        let late = bean
            .reservation()
            .acquire(bean.channel_server().udp_addr(), Transport::Udp)
            .await;
        assert!(matches!(late, Err(ConnectionError::Shutdown)));
    }

    #[tokio::test]
    async fn test_child_shutdown_keeps_master_serving() {
        let (master, children) = master_with_children(2).await;
        let client = PeerCreator::master(PeerConfig::for_testing(), None).await.unwrap();
        let rpc = HandshakeRpc::new(&client);

        children[0].shutdown().await;
        children[0].shutdown().await;

        let master_address = master.peer_bean().server_address();
        let responder = rpc.ping(&master_address, Transport::Udp).await.unwrap();
        assert_eq!(responder.peer_id(), master.peer_id());

        let sibling = children[1].peer_bean().server_address();
        assert_eq!(rpc.ping(&sibling, Transport::Tcp).await.unwrap().peer_id(), children[1].peer_id());
        assert!(!master.connection_bean().channel_server().is_shut_down());

        client.shutdown().await;
        master.shutdown().await;
    }
}
