//! # Dispatch Over the Wire
//!
//! Requests sent through one peer's `Sender` to another peer's
//! `ChannelServer` and `Dispatcher`:
//!
//! - unregistered commands and recipients are answered with `UnknownId`
//! - removing a key stops delivery; registering again restores it
//! - a failing handler yields an `Exception` response carrying its error
//! - traffic from another network id gets no answer

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use dht_connection::{
        ConnectionError, DispatchError, DispatchHandler, PeerConfig, PeerCreator, Transport,
    };
    use dht_types::{PeerAddress, PeerId};
    use dht_wire::{Command, Message, MessageType};

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    /// Echoes the request payload; fails on an empty one.
    struct Echo {
        calls: AtomicUsize,
    }

    impl Echo {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DispatchHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn handle_request(&self, request: &Message) -> Result<Message, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.payload.is_empty() {
                return Err(DispatchError::handler("echo", "empty payload"));
            }
            Ok(Message::response_to(request, MessageType::Ok).with_payload(request.payload.clone()))
        }
    }

    async fn pair() -> (PeerCreator, PeerCreator) {
        let server = PeerCreator::master(PeerConfig::for_testing(), None).await.unwrap();
        let client = PeerCreator::master(PeerConfig::for_testing(), None).await.unwrap();
        (server, client)
    }

    fn request(from: &PeerCreator, to: &PeerAddress, command: Command, payload: &'static [u8]) -> Message {
        Message::request(
            from.connection_bean().p2p_id(),
            command,
            MessageType::Request1,
            from.peer_bean().server_address(),
            to.clone(),
        )
        .with_payload(payload)
    }

    async fn send(
        from: &PeerCreator,
        to: &PeerAddress,
        message: Message,
        transport: Transport,
    ) -> Result<Message, ConnectionError> {
        from.connection_bean()
            .sender()
            .send_request(to, message, transport, Duration::from_secs(1))
            .await
    }

    fn register(peer: &PeerCreator, handler: Arc<Echo>, commands: &[Command]) {
        let id = peer.peer_id();
        let codes: Vec<u8> = commands.iter().map(|c| c.code()).collect();
        peer.connection_bean()
            .dispatcher()
            .register_io_handler(id, id, handler, &codes)
            .unwrap();
    }

    fn assert_rejected(result: Result<Message, ConnectionError>, expected: MessageType) -> String {
        match result {
            Err(ConnectionError::Rejected { kind, reason, .. }) => {
                assert_eq!(kind, expected);
                reason
            }
            other => panic!("expected {expected:?} rejection, got {other:?}"),
        }
    }

    // =============================================================================
    // ROUTING
    // =============================================================================

    #[tokio::test]
    async fn test_unknown_command_rejected_on_both_transports() {
        let (server, client) = pair().await;
        let echo = Echo::new();
        register(&server, echo.clone(), &[Command::Get]);
        let target = server.peer_bean().server_address();

        for transport in [Transport::Udp, Transport::Tcp] {
            let result = send(&client, &target, request(&client, &target, Command::Put, b"v"), transport).await;
            assert_rejected(result, MessageType::UnknownId);

            let response = send(&client, &target, request(&client, &target, Command::Get, b"v"), transport)
                .await
                .unwrap();
            assert_eq!(&response.payload[..], b"v");
        }
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_recipient_rejected() {
        let (server, client) = pair().await;
        register(&server, Echo::new(), &[Command::Get]);
        let stranger = server.peer_bean().server_address().change_peer_id(PeerId::random());

        let result = send(&client, &stranger, request(&client, &stranger, Command::Get, b"v"), Transport::Udp).await;
        assert_rejected(result, MessageType::UnknownId);

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_then_register_restores_delivery() {
        let (server, client) = pair().await;
        let target = server.peer_bean().server_address();
        let id = server.peer_id();
        register(&server, Echo::new(), &[Command::Put, Command::Get]);

        assert!(server.connection_bean().dispatcher().remove_io_handlers(id, id));
        let result = send(&client, &target, request(&client, &target, Command::Put, b"a"), Transport::Udp).await;
        assert_rejected(result, MessageType::UnknownId);

        register(&server, Echo::new(), &[Command::Put, Command::Get]);
        for command in [Command::Put, Command::Get] {
            let response = send(&client, &target, request(&client, &target, command, b"a"), Transport::Udp)
                .await
                .unwrap();
            assert_eq!(response.kind, MessageType::Ok);
        }

        client.shutdown().await;
        server.shutdown().await;
    }

    // =============================================================================
    // FAULTS
    // =============================================================================

    #[tokio::test]
    async fn test_handler_fault_becomes_exception_response() {
        let (server, client) = pair().await;
        register(&server, Echo::new(), &[Command::Put]);
        let target = server.peer_bean().server_address();

        let result = send(&client, &target, request(&client, &target, Command::Put, b""), Transport::Tcp).await;
        let reason = assert_rejected(result, MessageType::Exception);
        assert!(reason.contains("empty payload"));

        // the connection survives a handler fault
        let response = send(&client, &target, request(&client, &target, Command::Put, b"x"), Transport::Tcp)
            .await
            .unwrap();
        assert_eq!(response.kind, MessageType::Ok);

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_foreign_network_gets_no_answer() {
        let (server, client) = pair().await;
        let echo = Echo::new();
        register(&server, echo.clone(), &[Command::Get]);
        let target = server.peer_bean().server_address();

        let mut foreign = request(&client, &target, Command::Get, b"v");
        foreign.p2p_id = client.connection_bean().p2p_id() + 1;
        let result = client
            .connection_bean()
            .sender()
            .send_request(&target, foreign, Transport::Udp, Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(ConnectionError::Timeout { .. })));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);

        client.shutdown().await;
        server.shutdown().await;
    }
}
