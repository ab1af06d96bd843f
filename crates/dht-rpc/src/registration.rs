//! Handler registration helper for RPC modules.

use std::sync::Arc;

use tracing::debug;

use dht_connection::{DispatchError, DispatchHandler, Dispatcher};
use dht_types::CompositeKey;
use dht_wire::Command;

/// Register `handler` for each of `commands` under `key`.
///
/// Listing a command twice is rejected with `DispatchError::DuplicateCommand`
/// and leaves the registry untouched.
pub fn register_commands(
    dispatcher: &Dispatcher,
    key: CompositeKey,
    handler: Arc<dyn DispatchHandler>,
    commands: &[Command],
) -> Result<(), DispatchError> {
    let codes: Vec<u8> = commands.iter().map(|c| c.code()).collect();
    let name = handler.name().to_string();
    dispatcher.register_io_handler(key.owner, key.on_behalf_of, handler, &codes)?;
    debug!(handler = %name, ?commands, owner = ?key.owner, "Registered RPC handler");
    Ok(())
}
