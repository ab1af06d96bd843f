//! # Reservation
//!
//! Admission control and pooling for outbound channels.
//!
//! - A semaphore sized to `max_in_use_channels` bounds how many channels are
//!   checked out at once. Acquiring past the ceiling waits for a release.
//! - Released channels go back to an idle pool keyed by destination and
//!   transport, up to `max_idle_per_destination`; extras are closed.
//! - `shutdown()` closes the semaphore (every waiting and future acquire
//!   fails with `Shutdown`) and closes every idle and in-use channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use dht_telemetry::{log_event, metric_inc, RESERVATION_IN_USE};
use dht_wire::{MAX_DATAGRAM_BYTES, MAX_MESSAGE_BYTES};

use crate::channel::Channel;
use crate::config::{ChannelClientConfig, Transport};
use crate::error::ConnectionError;
use crate::pipeline::Pipeline;

type PoolKey = (SocketAddr, Transport);

struct ReservationState {
    config: ChannelClientConfig,
    udp_pipeline: Arc<Pipeline>,
    tcp_pipeline: Arc<Pipeline>,
    permits: Arc<Semaphore>,
    idle: Mutex<HashMap<PoolKey, Vec<Arc<Channel>>>>,
    in_use: Mutex<HashMap<u64, Arc<Channel>>>,
    shut_down: AtomicBool,
}

impl ReservationState {
    fn checked_in(&self, channel: &Channel) {
        if self.in_use.lock().remove(&channel.id()).is_some() {
            RESERVATION_IN_USE.dec();
        }
    }
}

/// Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct Reservation {
    state: Arc<ReservationState>,
}

impl Reservation {
    pub fn new(config: ChannelClientConfig, p2p_id: i32) -> Self {
        let permits = Arc::new(Semaphore::new(config.in_use_ceiling()));
        Self {
            state: Arc::new(ReservationState {
                udp_pipeline: Pipeline::standard(Transport::Udp, p2p_id, MAX_DATAGRAM_BYTES),
                tcp_pipeline: Pipeline::standard(Transport::Tcp, p2p_id, MAX_MESSAGE_BYTES),
                config,
                permits,
                idle: Mutex::new(HashMap::new()),
                in_use: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ChannelClientConfig {
        &self.state.config
    }

    /// Check out a channel to `destination`, reusing an idle one when possible.
    ///
    /// Waits while the in-use ceiling is reached.
    pub async fn acquire(
        &self,
        destination: SocketAddr,
        transport: Transport,
    ) -> Result<ReservedChannel, ConnectionError> {
        self.checkout(destination, transport, true).await
    }

    /// Like [`Reservation::acquire`] but always opens a new channel.
    pub async fn acquire_fresh(
        &self,
        destination: SocketAddr,
        transport: Transport,
    ) -> Result<ReservedChannel, ConnectionError> {
        self.checkout(destination, transport, false).await
    }

    async fn checkout(
        &self,
        destination: SocketAddr,
        transport: Transport,
        reuse: bool,
    ) -> Result<ReservedChannel, ConnectionError> {
        let state = &self.state;
        if state.shut_down.load(Ordering::Acquire) {
            return Err(ConnectionError::Shutdown);
        }
        let permit = Arc::clone(&state.permits)
            .acquire_owned()
            .await
            .map_err(|_| ConnectionError::Shutdown)?;

        let pooled = if reuse {
            self.take_idle(destination, transport)
        } else {
            None
        };
        let reused = pooled.is_some();
        let channel = match pooled {
            Some(channel) => {
                debug!(channel = channel.id(), %destination, %transport, "Reusing pooled channel");
                channel
            }
            None => self.open(destination, transport).await?,
        };

        {
            let mut in_use = state.in_use.lock();
            // a shutdown that ran while the channel was opening already
            // drained in_use, so this channel would never be closed
            if state.shut_down.load(Ordering::Acquire) {
                drop(in_use);
                channel.close();
                return Err(ConnectionError::Shutdown);
            }
            in_use.insert(channel.id(), Arc::clone(&channel));
        }
        metric_inc!(RESERVATION_IN_USE);

        Ok(ReservedChannel {
            channel,
            key: (destination, transport),
            reused,
            state: Arc::clone(&self.state),
            permit: Some(permit),
        })
    }

    /// Pop the newest idle channel whose remote is still there. Channels the
    /// remote closed while pooled are closed here.
    fn take_idle(&self, destination: SocketAddr, transport: Transport) -> Option<Arc<Channel>> {
        let mut dead = Vec::new();
        let live = {
            let mut idle = self.state.idle.lock();
            let pooled = idle.get_mut(&(destination, transport))?;
            let mut live = None;
            while let Some(channel) = pooled.pop() {
                if channel.is_active() && channel.remote_open() {
                    live = Some(channel);
                    break;
                }
                dead.push(channel);
            }
            live
        };
        for channel in dead {
            debug!(channel = channel.id(), %destination, "Evicting dead pooled channel");
            channel.close();
        }
        live
    }

    async fn open(&self, destination: SocketAddr, transport: Transport) -> Result<Arc<Channel>, ConnectionError> {
        let config = &self.state.config;
        match transport {
            Transport::Udp => {
                Channel::connect_udp(destination, config.bind_ip, Arc::clone(&self.state.udp_pipeline)).await
            }
            Transport::Tcp => {
                Channel::connect_tcp(
                    destination,
                    config.connect_timeout(),
                    Arc::clone(&self.state.tcp_pipeline),
                )
                .await
            }
        }
    }

    /// Channels currently checked out.
    pub fn in_use_count(&self) -> usize {
        self.state.in_use.lock().len()
    }

    pub fn idle_count(&self) -> usize {
        self.state.idle.lock().values().map(Vec::len).sum()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.shut_down.load(Ordering::Acquire)
    }

    /// Close every channel and fail every pending acquire. One-shot.
    pub async fn shutdown(&self) {
        let state = &self.state;
        if state.shut_down.swap(true, Ordering::AcqRel) {
            debug!("Reservation already shut down");
            return;
        }
        state.permits.close();

        let idle: Vec<Arc<Channel>> = state.idle.lock().drain().flat_map(|(_, v)| v).collect();
        let in_use: Vec<Arc<Channel>> = state.in_use.lock().drain().map(|(_, c)| c).collect();
        RESERVATION_IN_USE.sub(in_use.len() as f64);

        log_event!(info, "reservation", "Shutting down reservation", idle = idle.len(), in_use = in_use.len());
        for channel in idle.iter().chain(in_use.iter()) {
            channel.close();
        }
        tokio::task::yield_now().await;
    }
}

/// A checked-out channel. Give it back with [`ReservedChannel::release`];
/// dropping it closes the channel instead of pooling it.
pub struct ReservedChannel {
    channel: Arc<Channel>,
    key: PoolKey,
    reused: bool,
    state: Arc<ReservationState>,
    permit: Option<OwnedSemaphorePermit>,
}

impl ReservedChannel {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn destination(&self) -> SocketAddr {
        self.key.0
    }

    /// Taken from the idle pool rather than opened for this checkout.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Return the channel. Reusable channels are pooled while the pool for
    /// this destination has room; everything else is closed.
    pub fn release(mut self, reusable: bool) {
        let state = Arc::clone(&self.state);
        state.checked_in(&self.channel);

        let mut pooled = false;
        if reusable && self.channel.is_active() {
            let mut idle = state.idle.lock();
            if !state.shut_down.load(Ordering::Acquire) {
                let bucket = idle.entry(self.key).or_default();
                if bucket.len() < state.config.max_idle_per_destination {
                    bucket.push(Arc::clone(&self.channel));
                    pooled = true;
                }
            }
        }
        if !pooled {
            self.channel.close();
        }
        // releasing the permit last keeps in_use within the ceiling
        self.permit.take();
    }
}

impl Drop for ReservedChannel {
    fn drop(&mut self) {
        if self.permit.is_some() {
            self.state.checked_in(&self.channel);
            self.channel.close();
        }
    }
}
