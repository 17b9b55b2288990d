//! The DIMSE verb library: request/response cycles built on the exchange
//! layer, each with its own status-code handling.

use crate::channel::{DimseChannel, Received};
use crate::error::{DimseError, Result};
use crate::types::CommandSet;

pub mod echo;
pub mod find;
pub mod object;
pub mod retrieve;
pub mod store;

pub use echo::echo;
pub use find::{find, FindOutcome};
pub use object::{n_create, n_set, CreateOutcome, SetOutcome};
pub use retrieve::{move_to, MoveOutcome};
pub use store::{store, StoreOutcome};

/// Unwrap a received command, validating that it answers `request_id`.
///
/// A mismatched "responding to" ID is a protocol failure and aborts the
/// association.
pub(crate) async fn response_to<C: DimseChannel + ?Sized>(
    channel: &mut C,
    received: Received,
    request_id: u16,
) -> Result<(u8, CommandSet)> {
    let (context_id, command) = match received {
        Received::Command {
            context_id,
            command,
        } => (context_id, command),
        other => {
            return Err(DimseError::internal(format!(
                "unexpected receive outcome: {:?}",
                other
            )))
        }
    };
    if command.responded_to != Some(request_id) {
        channel.abort().await;
        return Err(DimseError::protocol(format!(
            "response correlates to message {:?}, expected {}",
            command.responded_to, request_id
        )));
    }
    Ok((context_id, command))
}
