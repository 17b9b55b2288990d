//! Verification service (C-ECHO)

use tracing::{info, warn};

use crate::channel::{DimseChannel, Expected, ReceiveFlags};
use crate::error::{DimseError, Result};
use crate::types::{CommandField, CommandSet, StatusClass};
use crate::uids;

/// Run one verification cycle.
///
/// Succeeds iff the peer answers with a success status. An unexpectedly
/// attached record is read, logged and ignored.
pub async fn echo<C: DimseChannel + ?Sized>(channel: &mut C) -> Result<()> {
    let context = channel
        .context_for(uids::VERIFICATION)
        .ok_or_else(|| DimseError::NoAcceptedContext(uids::VERIFICATION.to_string()))?;

    let message_id = channel.next_message_id();
    let request =
        CommandSet::request(CommandField::CEchoRq, message_id).with_sop_class(uids::VERIFICATION);
    channel.send_command(context.id, request, None).await?;

    let timeout = channel.read_timeout();
    let received = channel
        .receive_command(
            Expected::Only(CommandField::CEchoRsp),
            timeout,
            ReceiveFlags::default(),
        )
        .await?;
    let (context_id, response) = super::response_to(channel, received, message_id).await?;

    if response.has_dataset {
        let stray = channel.receive_record(context_id).await?;
        warn!(
            elements = stray.len(),
            "ignoring unexpected record attached to C-ECHO response"
        );
    }

    let status = response.status();
    if status.class() == StatusClass::Success {
        info!("verification succeeded");
        Ok(())
    } else {
        Err(DimseError::refused(
            status,
            format!("verification answered with status {}", status),
        ))
    }
}
