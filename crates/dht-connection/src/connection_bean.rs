//! Transport state shared by a master peer and all of its children.

use std::sync::Arc;

use crate::channel_server::ChannelServer;
use crate::config::ChannelClientConfig;
use crate::dispatcher::Dispatcher;
use crate::reservation::Reservation;
use crate::sender::Sender;
use crate::timer::Timer;

/// One per physical transport. Created by the master peer and released only
/// by the master's shutdown.
pub struct ConnectionBean {
    p2p_id: i32,
    dispatcher: Arc<Dispatcher>,
    sender: Arc<Sender>,
    channel_server: Arc<ChannelServer>,
    reservation: Reservation,
    client_config: ChannelClientConfig,
    timer: Arc<Timer>,
}

impl ConnectionBean {
    pub fn new(
        p2p_id: i32,
        dispatcher: Arc<Dispatcher>,
        sender: Arc<Sender>,
        channel_server: Arc<ChannelServer>,
        timer: Arc<Timer>,
    ) -> Self {
        let reservation = sender.reservation().clone();
        let client_config = reservation.config().clone();
        Self {
            p2p_id,
            dispatcher,
            sender,
            channel_server,
            reservation,
            client_config,
            timer,
        }
    }

    /// Network id; traffic carrying another id is dropped.
    pub fn p2p_id(&self) -> i32 {
        self.p2p_id
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn sender(&self) -> &Arc<Sender> {
        &self.sender
    }

    pub fn channel_server(&self) -> &Arc<ChannelServer> {
        &self.channel_server
    }

    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    pub fn client_config(&self) -> &ChannelClientConfig {
        &self.client_config
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }
}
