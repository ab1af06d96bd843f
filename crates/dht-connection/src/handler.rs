//! Contract implemented by every RPC module that receives routed requests.

use async_trait::async_trait;

use dht_wire::Message;

use crate::error::DispatchError;

/// Handles requests for the commands it was registered under.
///
/// Handlers are invoked concurrently for distinct inbound messages. The
/// returned message is sent back to the requester as is, so implementations
/// usually start from [`Message::response_to`] and set their own address as
/// sender.
#[async_trait]
pub trait DispatchHandler: Send + Sync {
    /// Short name used in logs and error responses.
    fn name(&self) -> &str;

    async fn handle_request(&self, request: &Message) -> Result<Message, DispatchError>;
}
