//! # Channel Server
//!
//! Inbound side of a transport. One UDP listener and one TCP acceptor are
//! shared by the master peer and all of its children.
//!
//! ```text
//! datagram / frame ─► Channel::receive_message ─► Dispatcher::message_received
//!                                                         │
//!           Channel::send_message(_to) ◄──── response ◄───┘
//! ```
//!
//! UDP requests are answered concurrently, each on its own task. A TCP
//! connection is served in order and closed once idle for longer than the
//! heartbeat interval.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use dht_telemetry::log_event;
use dht_wire::{Message, MessageType, MAX_DATAGRAM_BYTES, MAX_MESSAGE_BYTES};

use crate::channel::Channel;
use crate::config::{ChannelServerConfig, Transport};
use crate::dispatcher::Dispatcher;
use crate::error::ConnectionError;
use crate::peer_status::PeerStatusListeners;
use crate::pipeline::Pipeline;

type Connections = Arc<Mutex<HashMap<u64, Arc<Channel>>>>;

pub struct ChannelServer {
    udp: Arc<Channel>,
    tcp_addr: SocketAddr,
    heartbeat: Duration,
    connections: Connections,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// What the serving loops need to answer a request.
#[derive(Clone)]
struct Inbound {
    dispatcher: Arc<Dispatcher>,
    listeners: PeerStatusListeners,
}

impl Inbound {
    async fn answer(&self, request: &Message) -> Option<Message> {
        let response = self.dispatcher.message_received(request).await?;
        if response.kind != MessageType::UnknownId {
            self.listeners.notify_found(&request.sender, Some(&response.sender));
        }
        if request.kind.is_fire_and_forget() {
            return None;
        }
        Some(response)
    }
}

impl ChannelServer {
    /// Bind both listeners and start serving.
    ///
    /// Fails with `ConnectionError::Bind` if either socket cannot be bound;
    /// nothing stays open in that case.
    pub async fn start(
        config: &ChannelServerConfig,
        p2p_id: i32,
        dispatcher: Arc<Dispatcher>,
        listeners: PeerStatusListeners,
    ) -> Result<Arc<Self>, ConnectionError> {
        let udp_bind = SocketAddr::new(config.bind_ip, config.udp_port);
        let udp_socket = UdpSocket::bind(udp_bind)
            .await
            .map_err(|source| ConnectionError::Bind {
                transport: Transport::Udp,
                addr: udp_bind,
                source,
            })?;
        let tcp_bind = SocketAddr::new(config.bind_ip, config.tcp_port);
        let tcp_listener = TcpListener::bind(tcp_bind)
            .await
            .map_err(|source| ConnectionError::Bind {
                transport: Transport::Tcp,
                addr: tcp_bind,
                source,
            })?;
        let tcp_addr = tcp_listener.local_addr()?;

        let udp = Channel::udp_listener(
            udp_socket,
            Pipeline::standard(Transport::Udp, p2p_id, MAX_DATAGRAM_BYTES),
        )?;
        let tcp_pipeline = Pipeline::standard(Transport::Tcp, p2p_id, MAX_MESSAGE_BYTES);
        let (stop, stop_rx) = watch::channel(false);

        let server = Arc::new(Self {
            udp: Arc::clone(&udp),
            tcp_addr,
            heartbeat: config.heartbeat(),
            connections: Arc::new(Mutex::new(HashMap::new())),
            stop,
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        });

        let inbound = Inbound {
            dispatcher,
            listeners,
        };
        let udp_task = tokio::spawn(serve_udp(udp, inbound.clone()));
        let tcp_task = tokio::spawn(accept_tcp(
            tcp_listener,
            tcp_pipeline,
            inbound,
            Arc::clone(&server.connections),
            server.heartbeat,
            stop_rx,
        ));
        server.tasks.lock().extend([udp_task, tcp_task]);

        log_event!(
            info,
            "channel_server",
            "Channel server started",
            udp = %server.udp_addr(),
            tcp = %server.tcp_addr,
            heartbeat_ms = server.heartbeat.as_millis() as u64
        );
        Ok(server)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    /// Open inbound TCP connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop accepting, close the listeners and every inbound connection, and
    /// wait for the serving loops to exit. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            debug!("Channel server already shut down");
            return;
        }
        self.stop.send_replace(true);
        self.udp.close();

        let connections: Vec<Arc<Channel>> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in &connections {
            connection.close();
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(error) = task.await {
                if !error.is_cancelled() {
                    warn!(%error, "Server loop ended abnormally");
                }
            }
        }
        log_event!(info, "channel_server", "Channel server stopped", connections = connections.len());
    }
}

async fn serve_udp(channel: Arc<Channel>, inbound: Inbound) {
    loop {
        match channel.receive_message().await {
            Ok(Some(request)) => {
                let channel = Arc::clone(&channel);
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    let Some(response) = inbound.answer(&request).await else {
                        return;
                    };
                    let Some(target) = request.observed_remote else {
                        return;
                    };
                    if let Err(error) = channel.send_message_to(&response, target).await {
                        debug!(%target, %error, "Failed to answer datagram");
                    }
                });
            }
            Ok(None) => {}
            Err(ConnectionError::ChannelClosed) => break,
            Err(error @ ConnectionError::Decode(_)) => {
                inbound.dispatcher.exception_caught(&channel, &error);
            }
            Err(error) => {
                if !channel.is_open() {
                    break;
                }
                // e.g. ICMP unreachable reported on the socket
                debug!(%error, "UDP receive failed");
            }
        }
    }
    debug!(channel = channel.id(), "UDP loop stopped");
}

async fn accept_tcp(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    inbound: Inbound,
    connections: Connections,
    heartbeat: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "TCP accept failed");
                        continue;
                    }
                };
                let channel = match Channel::from_tcp_stream(stream, Arc::clone(&pipeline)) {
                    Ok(channel) => channel,
                    Err(error) => {
                        warn!(%remote, %error, "Dropping inbound connection");
                        continue;
                    }
                };
                debug!(channel = channel.id(), %remote, "Accepted connection");

                connections.lock().insert(channel.id(), Arc::clone(&channel));
                let tracked = Arc::clone(&connections);
                channel.on_closed(move |closed| {
                    tracked.lock().remove(&closed.id());
                });
                // a shutdown that drained the map before the insert
                if *stop.borrow() {
                    channel.close();
                    break;
                }
                tokio::spawn(serve_tcp(channel, inbound.clone(), heartbeat));
            }
        }
    }
    debug!("TCP acceptor stopped");
}

async fn serve_tcp(channel: Arc<Channel>, inbound: Inbound, heartbeat: Duration) {
    loop {
        let received = match tokio::time::timeout(heartbeat, channel.receive_message()).await {
            Ok(received) => received,
            Err(_) => {
                debug!(channel = channel.id(), "Closing idle connection");
                channel.close();
                break;
            }
        };
        match received {
            Ok(Some(request)) => {
                let Some(response) = inbound.answer(&request).await else {
                    continue;
                };
                if let Err(error) = channel.send_message(&response).await {
                    inbound.dispatcher.exception_caught(&channel, &error);
                    break;
                }
            }
            Ok(None) => {}
            Err(ConnectionError::ChannelClosed) => break,
            Err(error) => {
                inbound.dispatcher.exception_caught(&channel, &error);
                break;
            }
        }
    }
}
