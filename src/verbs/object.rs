//! Object lifecycle services (N-CREATE, N-SET)

use tracing::{info, warn};

use crate::channel::{DimseChannel, Expected, ReceiveFlags};
use crate::error::{DimseError, Result};
use crate::record::Record;
use crate::types::{CommandField, CommandSet, Status};

/// Result of an object-creation cycle
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    /// Final status reported by the peer
    pub status: Status,
    /// The created instance UID, from whichever side assigned it
    pub instance_uid: Option<String>,
    /// Server-chosen attribute values, when the peer returned them
    pub attributes: Option<Record>,
}

/// Result of an object-modification cycle
#[derive(Debug, Clone)]
pub struct SetOutcome {
    /// Final status reported by the peer
    pub status: Status,
    /// The modified attribute values, when the peer returned them
    pub attributes: Option<Record>,
}

/// How a non-success status is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Raise a failure
    Raise,
    /// Accept the degraded result with a logged warning
    Accept,
}

/// Status table shared by the object lifecycle verbs
const OBJECT_STATUS_TABLE: &[(u16, &str, Disposition)] = &[
    (0x0105, "no such attribute", Disposition::Raise),
    (0x0106, "invalid attribute value", Disposition::Raise),
    (0x0107, "attribute list error", Disposition::Accept),
    (0x0110, "processing failure", Disposition::Raise),
    (0x0111, "duplicate SOP instance", Disposition::Raise),
    (0x0112, "no such SOP instance", Disposition::Raise),
    (0x0116, "attribute value out of range", Disposition::Accept),
    (0x0117, "invalid object instance", Disposition::Raise),
    (0x0118, "no such SOP class", Disposition::Raise),
    (0x0119, "class-instance conflict", Disposition::Raise),
    (0x0120, "missing attribute", Disposition::Raise),
    (0x0121, "missing attribute value", Disposition::Raise),
    (0x0122, "SOP class not supported", Disposition::Raise),
    (0x0124, "refused: not authorized", Disposition::Raise),
];

fn classify(status: Status) -> (String, Disposition) {
    for (code, message, disposition) in OBJECT_STATUS_TABLE {
        if *code == status.0 {
            return ((*message).to_string(), *disposition);
        }
    }
    if matches!(status.0, 0xC000..=0xCFFF) {
        return ("unable to process".to_string(), Disposition::Raise);
    }
    (
        format!("unrecognized status {:#06X}", status.0),
        Disposition::Raise,
    )
}

/// Create an object with the peer.
///
/// The instance UID may be assigned by either side: omit it to let the peer
/// choose. A response that names the UID when the request already did, or
/// that leaves it unnamed when the request did too, is non-conformant but
/// tolerated.
pub async fn n_create<C: DimseChannel + ?Sized>(
    channel: &mut C,
    sop_class: &str,
    instance_uid: Option<&str>,
    attributes: Option<&Record>,
) -> Result<CreateOutcome> {
    let context = channel
        .context_for(sop_class)
        .ok_or_else(|| DimseError::NoAcceptedContext(sop_class.to_string()))?;

    let message_id = channel.next_message_id();
    let mut request =
        CommandSet::request(CommandField::NCreateRq, message_id).with_sop_class(sop_class);
    if let Some(uid) = instance_uid {
        request = request.with_sop_instance(uid);
    }
    channel.send_command(context.id, request, attributes).await?;

    let timeout = channel.read_timeout();
    let received = channel
        .receive_command(
            Expected::Only(CommandField::NCreateRsp),
            timeout,
            ReceiveFlags::default(),
        )
        .await?;
    let (context_id, response) = super::response_to(channel, received, message_id).await?;

    let returned_attributes = if response.has_dataset {
        Some(channel.receive_record(context_id).await?)
    } else {
        None
    };

    // Exactly one side should assign the UID; both or neither is
    // non-conformant but tolerated.
    let requested = instance_uid.is_some();
    let answered = response.sop_instance_uid.is_some();
    if requested == answered {
        warn!(
            requested,
            answered, "instance UID named by both sides or by neither"
        );
    }
    let resolved_uid = response
        .sop_instance_uid
        .clone()
        .or_else(|| instance_uid.map(str::to_string));

    let status = response.status();
    if status == Status::SUCCESS {
        info!(instance_uid = ?resolved_uid, "object created");
        return Ok(CreateOutcome {
            status,
            instance_uid: resolved_uid,
            attributes: returned_attributes,
        });
    }
    match classify(status) {
        (message, Disposition::Accept) => {
            warn!(status = %status, "object created with warning: {}", message);
            Ok(CreateOutcome {
                status,
                instance_uid: resolved_uid,
                attributes: returned_attributes,
            })
        }
        (message, Disposition::Raise) => Err(DimseError::refused(status, message)),
    }
}

/// Modify an existing object with the peer
pub async fn n_set<C: DimseChannel + ?Sized>(
    channel: &mut C,
    sop_class: &str,
    instance_uid: &str,
    modifications: &Record,
) -> Result<SetOutcome> {
    if instance_uid.is_empty() {
        return Err(DimseError::operation_failed(
            "modification requires an instance UID",
        ));
    }
    let context = channel
        .context_for(sop_class)
        .ok_or_else(|| DimseError::NoAcceptedContext(sop_class.to_string()))?;

    let message_id = channel.next_message_id();
    let request = CommandSet::request(CommandField::NSetRq, message_id)
        .with_sop_class(sop_class)
        .with_sop_instance(instance_uid);
    channel
        .send_command(context.id, request, Some(modifications))
        .await?;

    let timeout = channel.read_timeout();
    let received = channel
        .receive_command(
            Expected::Only(CommandField::NSetRsp),
            timeout,
            ReceiveFlags::default(),
        )
        .await?;
    let (context_id, response) = super::response_to(channel, received, message_id).await?;

    let returned_attributes = if response.has_dataset {
        Some(channel.receive_record(context_id).await?)
    } else {
        None
    };

    let status = response.status();
    if status == Status::SUCCESS {
        info!(instance_uid = %instance_uid, "object modified");
        return Ok(SetOutcome {
            status,
            attributes: returned_attributes,
        });
    }
    match classify(status) {
        (message, Disposition::Accept) => {
            warn!(status = %status, "object modified with warning: {}", message);
            Ok(SetOutcome {
                status,
                attributes: returned_attributes,
            })
        }
        (message, Disposition::Raise) => Err(DimseError::refused(status, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_table_dispositions() {
        let (message, disposition) = classify(Status(0x0107));
        assert_eq!(disposition, Disposition::Accept);
        assert!(message.contains("attribute list"));

        let (_, disposition) = classify(Status(0x0116));
        assert_eq!(disposition, Disposition::Accept);

        let (message, disposition) = classify(Status(0x0112));
        assert_eq!(disposition, Disposition::Raise);
        assert!(message.contains("no such SOP instance"));

        let (_, disposition) = classify(Status(0xC010));
        assert_eq!(disposition, Disposition::Raise);

        let (message, disposition) = classify(Status(0x4242));
        assert_eq!(disposition, Disposition::Raise);
        assert!(message.contains("unrecognized"));
    }
}
