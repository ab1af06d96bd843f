//! # Sender
//!
//! Outbound request/response exchanges.
//!
//! ```text
//! acquire channel ─► write request ─► await response with same message id
//!        │                                   │
//!        └──────── release (reusable) ◄──────┘ success
//!                  release (discard)  ◄────── timeout / transport / decode fault
//! ```
//!
//! Requests are independent: each has its own channel for its lifetime and
//! no ordering holds between concurrent requests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use dht_telemetry::{metric_inc, HistogramTimer, REQUESTS_FAILED, REQUESTS_SENT, REQUEST_LATENCY};
use dht_types::PeerAddress;
use dht_wire::Message;

use crate::channel::Channel;
use crate::config::Transport;
use crate::error::ConnectionError;
use crate::peer_status::PeerStatusListeners;
use crate::reservation::Reservation;

pub struct Sender {
    reservation: Reservation,
    listeners: PeerStatusListeners,
    next_message_id: AtomicI32,
}

impl Sender {
    pub fn new(reservation: Reservation, listeners: PeerStatusListeners) -> Self {
        Self {
            reservation,
            listeners,
            next_message_id: AtomicI32::new(rand::random()),
        }
    }

    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    /// Wraps on overflow.
    pub fn next_message_id(&self) -> i32 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send with the configured default timeout.
    pub async fn send(
        &self,
        destination: &PeerAddress,
        request: Message,
        transport: Transport,
    ) -> Result<Message, ConnectionError> {
        let timeout = self.reservation.config().request_timeout();
        self.send_request(destination, request, transport, timeout).await
    }

    /// Send `request` to `destination` and wait up to `timeout` for the
    /// correlated response.
    ///
    /// Error responses (`UnknownId`, `Exception`, `Denied`, `Cancel`) come
    /// back as `ConnectionError::Rejected`.
    pub async fn send_request(
        &self,
        destination: &PeerAddress,
        mut request: Message,
        transport: Transport,
        timeout: Duration,
    ) -> Result<Message, ConnectionError> {
        request.message_id = self.next_message_id();
        let target = match transport {
            Transport::Udp => destination.udp_addr(),
            Transport::Tcp => destination.tcp_addr(),
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut reserved = match self.reservation.acquire(target, transport).await {
            Ok(reserved) => reserved,
            Err(error) => return Err(self.failed(destination, error)),
        };
        metric_inc!(REQUESTS_SENT, &[transport.as_str()]);
        let latency = HistogramTimer::new(&REQUEST_LATENCY);

        let mut outcome = Self::exchange_until(deadline, reserved.channel(), &request, target, timeout).await;

        // the remote may close a pooled connection between our liveness check
        // and the write; one retry on a new connection covers that window
        if reserved.is_reused() && outcome.as_ref().is_err_and(ConnectionError::is_stale_channel) {
            debug!(channel = reserved.channel().id(), %target, "Pooled channel went stale, reconnecting");
            reserved.release(false);
            reserved = match self.reservation.acquire_fresh(target, transport).await {
                Ok(reserved) => reserved,
                Err(error) => {
                    latency.discard();
                    return Err(self.failed(destination, error));
                }
            };
            outcome = Self::exchange_until(deadline, reserved.channel(), &request, target, timeout).await;
        }

        match outcome {
            Ok(response) => {
                reserved.release(true);
                if response.kind.is_error() {
                    latency.discard();
                    let error = ConnectionError::Rejected {
                        responder: response.sender.peer_id(),
                        kind: response.kind,
                        reason: String::from_utf8_lossy(&response.payload).into_owned(),
                    };
                    metric_inc!(REQUESTS_FAILED, &[error.outcome()]);
                    // the peer answered, so it is reachable
                    self.listeners.notify_found(&response.sender, Some(&request.sender));
                    return Err(error);
                }
                drop(latency);
                self.listeners.notify_found(&response.sender, Some(&request.sender));
                Ok(response)
            }
            Err(error) => {
                latency.discard();
                reserved.release(false);
                Err(self.failed(destination, error))
            }
        }
    }

    /// Send a request that expects no answer. Completes once written.
    pub async fn send_fire_and_forget(
        &self,
        destination: &PeerAddress,
        mut request: Message,
        transport: Transport,
    ) -> Result<(), ConnectionError> {
        debug_assert!(request.kind.is_fire_and_forget());
        request.message_id = self.next_message_id();
        let target = match transport {
            Transport::Udp => destination.udp_addr(),
            Transport::Tcp => destination.tcp_addr(),
        };
        let reserved = match self.reservation.acquire(target, transport).await {
            Ok(reserved) => reserved,
            Err(error) => return Err(self.failed(destination, error)),
        };
        metric_inc!(REQUESTS_SENT, &[transport.as_str()]);
        match reserved.channel().send_message(&request).await {
            Ok(()) => {
                reserved.release(true);
                Ok(())
            }
            Err(error) => {
                reserved.release(false);
                Err(self.failed(destination, error))
            }
        }
    }

    fn failed(&self, destination: &PeerAddress, error: ConnectionError) -> ConnectionError {
        metric_inc!(REQUESTS_FAILED, &[error.outcome()]);
        match &error {
            ConnectionError::Shutdown => {
                debug!(destination = %destination, "Request refused, sender shut down");
            }
            _ => {
                warn!(destination = %destination, %error, "Request failed");
                self.listeners.notify_failed(destination, &error.to_string());
            }
        }
        error
    }

    async fn exchange_until(
        deadline: tokio::time::Instant,
        channel: &Channel,
        request: &Message,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<Message, ConnectionError> {
        match tokio::time::timeout_at(deadline, Self::exchange(channel, request)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout {
                destination: target,
                timeout,
            }),
        }
    }

    async fn exchange(channel: &Channel, request: &Message) -> Result<Message, ConnectionError> {
        channel.send_message(request).await?;
        loop {
            match channel.receive_message().await? {
                Some(message) if message.message_id == request.message_id && !message.is_request() => {
                    return Ok(message);
                }
                Some(other) => {
                    debug!(
                        expected = request.message_id,
                        got = other.message_id,
                        "Discarding uncorrelated message"
                    );
                }
                None => {}
            }
        }
    }
}
