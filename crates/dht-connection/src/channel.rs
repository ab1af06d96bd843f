//! # Channel
//!
//! One UDP or TCP endpoint plus the pipeline that encodes and decodes its
//! traffic.
//!
//! - UDP listener channels are shared by every logical peer on a transport
//!   and address each reply explicitly (`send_message_to`).
//! - UDP client channels and TCP channels are connected to one remote.
//! - TCP frames carry a 4-byte big-endian length prefix.
//!
//! `close()` is idempotent: the first caller releases the socket, cancels
//! pending sends and receives, and fires the closed observers. Later callers
//! only log.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, trace};

use dht_telemetry::{metric_inc, CHANNELS_CLOSED, CHANNELS_OPENED};
use dht_wire::{frame_header, frame_length, Message, FRAME_HEADER_BYTES, MAX_DATAGRAM_BYTES};

use crate::config::Transport;
use crate::error::ConnectionError;
use crate::pipeline::Pipeline;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

type ClosedObserver = Box<dyn FnOnce(&Channel) + Send>;
type WriteObserver = Arc<dyn Fn(&Channel, usize) + Send + Sync>;

/// Socket resources; `None` once released.
enum Io {
    Udp(Arc<UdpSocket>),
    Tcp {
        reader: Arc<AsyncMutex<OwnedReadHalf>>,
        writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    },
}

pub struct Channel {
    id: u64,
    transport: Transport,
    local: SocketAddr,
    /// `None` for the shared UDP listener.
    remote: Option<SocketAddr>,
    pipeline: Arc<Pipeline>,
    io: Mutex<Option<Io>>,
    closed: AtomicBool,
    cancel: watch::Sender<bool>,
    closed_observers: Mutex<Vec<ClosedObserver>>,
    write_observers: Mutex<Vec<WriteObserver>>,
}

impl Channel {
    fn new(
        transport: Transport,
        local: SocketAddr,
        remote: Option<SocketAddr>,
        pipeline: Arc<Pipeline>,
        io: Io,
    ) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        metric_inc!(CHANNELS_OPENED, &[transport.as_str()]);
        Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            local,
            remote,
            pipeline,
            io: Mutex::new(Some(io)),
            closed: AtomicBool::new(false),
            cancel,
            closed_observers: Mutex::new(Vec::new()),
            write_observers: Mutex::new(Vec::new()),
        })
    }

    /// Wrap a bound UDP socket that serves every remote.
    pub fn udp_listener(socket: UdpSocket, pipeline: Arc<Pipeline>) -> Result<Arc<Self>, ConnectionError> {
        let local = socket.local_addr()?;
        Ok(Self::new(Transport::Udp, local, None, pipeline, Io::Udp(Arc::new(socket))))
    }

    /// Bind an ephemeral UDP socket on `bind_ip` and connect it to `remote`.
    pub async fn connect_udp(
        remote: SocketAddr,
        bind_ip: std::net::IpAddr,
        pipeline: Arc<Pipeline>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let bind = SocketAddr::new(bind_ip, 0);
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|source| ConnectionError::Bind {
                transport: Transport::Udp,
                addr: bind,
                source,
            })?;
        socket.connect(remote).await?;
        let local = socket.local_addr()?;
        Ok(Self::new(
            Transport::Udp,
            local,
            Some(remote),
            pipeline,
            Io::Udp(Arc::new(socket)),
        ))
    }

    pub async fn connect_tcp(
        remote: SocketAddr,
        connect_timeout: Duration,
        pipeline: Arc<Pipeline>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(remote))
            .await
            .map_err(|_| ConnectionError::Timeout {
                destination: remote,
                timeout: connect_timeout,
            })??;
        Self::from_tcp_stream(stream, pipeline)
    }

    /// Wrap an accepted or connected stream.
    pub fn from_tcp_stream(stream: TcpStream, pipeline: Arc<Pipeline>) -> Result<Arc<Self>, ConnectionError> {
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(
            Transport::Tcp,
            local,
            Some(remote),
            pipeline,
            Io::Tcp {
                reader: Arc::new(AsyncMutex::new(reader)),
                writer: Arc::new(AsyncMutex::new(writer)),
            },
        ))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn is_udp(&self) -> bool {
        self.transport == Transport::Udp
    }

    pub fn is_tcp(&self) -> bool {
        self.transport == Transport::Tcp
    }

    /// True for the UDP listener shared by all peers on a transport.
    pub fn is_shared_listener(&self) -> bool {
        self.is_udp() && self.remote.is_none()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Open and still holding its socket.
    pub fn is_active(&self) -> bool {
        self.is_open() && self.io.lock().is_some()
    }

    /// Whether the remote end still looks connected. Never waits.
    ///
    /// A TCP stream the remote has closed reads EOF; one holding unread
    /// bytes between exchanges has lost its framing. Both count as gone.
    /// A reader busy in another task counts as gone too, since the channel
    /// is not idle.
    pub fn remote_open(&self) -> bool {
        let reader = match self.io.lock().as_ref() {
            Some(Io::Tcp { reader, .. }) => Arc::clone(reader),
            Some(Io::Udp(_)) => return self.is_open(),
            None => return false,
        };
        if !self.is_open() {
            return false;
        }
        let Ok(reader) = reader.try_lock() else {
            return false;
        };
        let mut byte = [0u8; 1];
        match reader.try_read(&mut byte) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Ok(0) => {
                debug!(channel = self.id, "Remote closed the stream");
                false
            }
            Ok(_) => {
                debug!(channel = self.id, "Unread bytes on an idle stream");
                false
            }
            Err(error) => {
                debug!(channel = self.id, %error, "Stream error on an idle channel");
                false
            }
        }
    }

    /// Run `observer` once when the channel closes. Runs immediately if it
    /// already has.
    pub fn on_closed(&self, observer: impl FnOnce(&Channel) + Send + 'static) {
        let mut observers = self.closed_observers.lock();
        if self.is_open() {
            observers.push(Box::new(observer));
            return;
        }
        drop(observers);
        observer(self);
    }

    /// Run `observer` after every completed write with the byte count.
    pub fn on_write_completed(&self, observer: impl Fn(&Channel, usize) + Send + Sync + 'static) {
        self.write_observers.lock().push(Arc::new(observer));
    }

    /// Close the channel. Safe to call any number of times from any task.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!(channel = self.id, "Channel already closed");
            return;
        }

        // wakes every pending send/receive
        self.cancel.send_replace(true);

        if self.io.lock().take().is_none() {
            debug!(channel = self.id, "Channel resources already released");
        }
        metric_inc!(CHANNELS_CLOSED, &[self.transport.as_str()]);
        trace!(channel = self.id, transport = %self.transport, "Channel closed");

        let observers = std::mem::take(&mut *self.closed_observers.lock());
        for observer in observers {
            observer(self);
        }
    }

    fn io_udp(&self) -> Result<Arc<UdpSocket>, ConnectionError> {
        match self.io.lock().as_ref() {
            Some(Io::Udp(socket)) => Ok(Arc::clone(socket)),
            _ => Err(ConnectionError::ChannelClosed),
        }
    }

    fn io_tcp_writer(&self) -> Result<Arc<AsyncMutex<OwnedWriteHalf>>, ConnectionError> {
        match self.io.lock().as_ref() {
            Some(Io::Tcp { writer, .. }) => Ok(Arc::clone(writer)),
            _ => Err(ConnectionError::ChannelClosed),
        }
    }

    fn io_tcp_reader(&self) -> Result<Arc<AsyncMutex<OwnedReadHalf>>, ConnectionError> {
        match self.io.lock().as_ref() {
            Some(Io::Tcp { reader, .. }) => Ok(Arc::clone(reader)),
            _ => Err(ConnectionError::ChannelClosed),
        }
    }

    /// Run `op` unless the channel closes first.
    async fn cancellable<T>(
        &self,
        op: impl std::future::Future<Output = Result<T, ConnectionError>>,
    ) -> Result<T, ConnectionError> {
        let mut cancel = self.cancel.subscribe();
        if *cancel.borrow_and_update() {
            return Err(ConnectionError::ChannelClosed);
        }
        tokio::select! {
            result = op => result,
            _ = cancel.changed() => Err(ConnectionError::ChannelClosed),
        }
    }

    fn encode(&self, message: &Message) -> Result<Option<Bytes>, ConnectionError> {
        Ok(self.pipeline.session().with_remote(self.remote).write(message.clone())?)
    }

    fn notify_write_completed(&self, len: usize) {
        let observers: Vec<WriteObserver> = self.write_observers.lock().clone();
        for observer in observers {
            observer(self, len);
        }
    }

    /// Send to the connected remote.
    pub async fn send_message(&self, message: &Message) -> Result<(), ConnectionError> {
        match self.remote {
            Some(remote) => self.send_message_to(message, remote).await,
            None => Err(ConnectionError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "listener channel needs an explicit target",
            ))),
        }
    }

    /// Send to `target`. Connected channels ignore `target`.
    pub async fn send_message_to(&self, message: &Message, target: SocketAddr) -> Result<(), ConnectionError> {
        let Some(bytes) = self.encode(message)? else {
            return Ok(());
        };
        let len = bytes.len();

        match self.transport {
            Transport::Udp => {
                let socket = self.io_udp()?;
                let connected = self.remote.is_some();
                self.cancellable(async move {
                    if connected {
                        socket.send(&bytes).await?;
                    } else {
                        socket.send_to(&bytes, target).await?;
                    }
                    Ok(())
                })
                .await?;
            }
            Transport::Tcp => {
                let header = frame_header(len).map_err(|source| crate::error::PipelineError::Codec {
                    stage: "framing",
                    source,
                })?;
                let writer = self.io_tcp_writer()?;
                self.cancellable(async move {
                    let mut writer = writer.lock().await;
                    writer.write_all(&header).await?;
                    writer.write_all(&bytes).await?;
                    writer.flush().await?;
                    Ok(())
                })
                .await?;
            }
        }

        self.notify_write_completed(len);
        Ok(())
    }

    /// Wait for the next inbound message.
    ///
    /// Returns `Ok(None)` when a pipeline stage dropped the message (for
    /// example traffic from another network). A TCP stream ending cleanly
    /// closes the channel and yields `ChannelClosed`.
    pub async fn receive_message(&self) -> Result<Option<Message>, ConnectionError> {
        let (bytes, from) = match self.transport {
            Transport::Udp => {
                let socket = self.io_udp()?;
                self.cancellable(async move {
                    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
                    let (len, from) = socket.recv_from(&mut buf).await?;
                    buf.truncate(len);
                    Ok((Bytes::from(buf), from))
                })
                .await?
            }
            Transport::Tcp => {
                let reader = self.io_tcp_reader()?;
                let remote = self.remote;
                let frame = self
                    .cancellable(async move {
                        let mut reader = reader.lock().await;
                        let mut header = [0u8; FRAME_HEADER_BYTES];
                        match reader.read_exact(&mut header).await {
                            Ok(_) => {}
                            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                                return Ok(None);
                            }
                            Err(e) => return Err(e.into()),
                        }
                        let len = frame_length(header).map_err(|source| {
                            crate::error::PipelineError::Codec {
                                stage: "framing",
                                source,
                            }
                        })?;
                        let mut body = vec![0u8; len];
                        reader.read_exact(&mut body).await?;
                        Ok(Some(Bytes::from(body)))
                    })
                    .await?;
                match (frame, remote) {
                    (Some(bytes), Some(remote)) => (bytes, remote),
                    _ => {
                        debug!(channel = self.id, "Stream ended");
                        self.close();
                        return Err(ConnectionError::ChannelClosed);
                    }
                }
            }
        };

        let mut session = self.pipeline.session().with_remote(Some(from));
        Ok(session.read(bytes)?)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.is_open() {
            self.close();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dht_types::{PeerAddress, PeerId};
    use dht_wire::{Command, MessageType, MAX_MESSAGE_BYTES};
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    fn pipeline(transport: Transport) -> Arc<Pipeline> {
        let max = match transport {
            Transport::Udp => MAX_DATAGRAM_BYTES,
            Transport::Tcp => MAX_MESSAGE_BYTES,
        };
        Pipeline::standard(transport, 1, max)
    }

    fn ping(id: i32) -> Message {
        let a = PeerAddress::unknown("127.0.0.1:4001".parse().unwrap()).change_peer_id(PeerId::random());
        let b = PeerAddress::unknown("127.0.0.1:4002".parse().unwrap()).change_peer_id(PeerId::random());
        Message::request(1, Command::Ping, MessageType::Request1, a, b).with_message_id(id)
    }

    async fn listener() -> Arc<Channel> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Channel::udp_listener(socket, pipeline(Transport::Udp)).unwrap()
    }

    #[tokio::test]
    async fn test_udp_exchange() {
        let server = listener().await;
        let client = Channel::connect_udp(
            server.local_addr(),
            "127.0.0.1".parse().unwrap(),
            pipeline(Transport::Udp),
        )
        .await
        .unwrap();

        let writes = Arc::new(AtomicUsize::new(0));
        let counter = writes.clone();
        client.on_write_completed(move |_, len| {
            assert!(len > 0);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.send_message(&ping(5)).await.unwrap();
        let received = server.receive_message().await.unwrap().unwrap();
        assert_eq!(received.message_id, 5);
        assert_eq!(received.observed_remote, Some(client.local_addr()));

        let reply = Message::response_to(&received, MessageType::Ok);
        server
            .send_message_to(&reply, client.local_addr())
            .await
            .unwrap();
        let answer = client.receive_message().await.unwrap().unwrap();
        assert_eq!(answer.kind, MessageType::Ok);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tcp_exchange_and_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Channel::connect_tcp(addr, Duration::from_secs(1), pipeline(Transport::Tcp))
            .await
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let server = Channel::from_tcp_stream(stream, pipeline(Transport::Tcp)).unwrap();

        client.send_message(&ping(11)).await.unwrap();
        client.send_message(&ping(12)).await.unwrap();
        assert_eq!(server.receive_message().await.unwrap().unwrap().message_id, 11);
        assert_eq!(server.receive_message().await.unwrap().unwrap().message_id, 12);

        client.close();
        assert!(matches!(
            server.receive_message().await,
            Err(ConnectionError::ChannelClosed)
        ));
        assert!(!server.is_open());
    }

    #[tokio::test]
    async fn test_tcp_write_is_length_prefixed() {
        use tokio::io::AsyncReadExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = Channel::connect_tcp(
            listener.local_addr().unwrap(),
            Duration::from_secs(1),
            pipeline(Transport::Tcp),
        )
        .await
        .unwrap();
        let (mut raw, _) = listener.accept().await.unwrap();

        let written = Arc::new(AtomicUsize::new(0));
        let counter = written.clone();
        client.on_write_completed(move |_, len| {
            counter.store(len, Ordering::SeqCst);
        });
        client.send_message(&ping(21)).await.unwrap();

        let mut header = [0u8; FRAME_HEADER_BYTES];
        raw.read_exact(&mut header).await.unwrap();
        let len = frame_length(header).unwrap();
        assert_eq!(len, written.load(Ordering::SeqCst));
        assert_eq!(header, frame_header(len).unwrap());
        let mut body = vec![0u8; len];
        raw.read_exact(&mut body).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_fires_once_under_concurrency() {
        let channel = listener().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        channel.on_closed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut handles = Vec::new();
        for _ in 0..8 {
            let channel = channel.clone();
            handles.push(tokio::spawn(async move { channel.close() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        channel.close();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!channel.is_open());
        assert!(!channel.is_active());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_receive() {
        let channel = listener().await;
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.receive_message().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.close();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_observer_registered_after_close_runs_immediately() {
        let channel = listener().await;
        channel.close();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        channel.on_closed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let channel = listener().await;
        channel.close();
        let err = channel
            .send_message_to(&ping(1), "127.0.0.1:9".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_garbage_datagram_is_decode_fault() {
        let server = listener().await;
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(&[0xde, 0xad], server.local_addr()).await.unwrap();

        let err = server.receive_message().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Decode(_)));
        assert!(server.is_open());
    }
}
