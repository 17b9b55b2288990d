//! Query service (C-FIND)

use dicom_core::VR;
use dicom_dictionary_std::tags;
use tracing::{debug, info, warn};

use crate::channel::{DimseChannel, Expected, ReceiveFlags};
use crate::error::{DimseError, Result};
use crate::record::Record;
use crate::types::{CommandField, CommandSet, Priority, QueryLevel, StatusClass};

/// Result of a query cycle
#[derive(Debug, Clone, Default)]
pub struct FindOutcome {
    /// Matching records, in arrival order
    pub records: Vec<Record>,
    /// Whether the cycle ended with a cancelled status
    pub cancelled: bool,
}

/// Start a query mask for the given retrieve level
pub fn base_mask(level: QueryLevel) -> Record {
    let mut mask = Record::new();
    mask.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, level.to_string());
    mask
}

/// Run one query cycle.
///
/// Sends the mask, then collects one record per pending response until a
/// final status arrives. A pending response without a record is tolerated
/// with a warning. When `max_results` is non-zero and reached, a cancel
/// request is issued and the cycle drains to its cancelled final status.
pub async fn find<C: DimseChannel + ?Sized>(
    channel: &mut C,
    sop_class: &str,
    mask: &Record,
    max_results: u32,
) -> Result<FindOutcome> {
    let context = channel
        .context_for(sop_class)
        .ok_or_else(|| DimseError::NoAcceptedContext(sop_class.to_string()))?;

    let message_id = channel.next_message_id();
    let request = CommandSet::request(CommandField::CFindRq, message_id)
        .with_sop_class(sop_class)
        .with_priority(Priority::Medium);
    channel.send_command(context.id, request, Some(mask)).await?;

    let mut outcome = FindOutcome::default();
    let mut cancel_requested = false;

    loop {
        let timeout = channel.read_timeout();
        let received = channel
            .receive_command(
                Expected::Only(CommandField::CFindRsp),
                timeout,
                ReceiveFlags::default(),
            )
            .await?;
        let (context_id, response) = super::response_to(channel, received, message_id).await?;

        let status = response.status();
        match status.class() {
            StatusClass::Pending => {
                if response.has_dataset {
                    let record = channel.receive_record(context_id).await?;
                    if cancel_requested {
                        debug!("dropping straggler result after cancel");
                    } else {
                        outcome.records.push(record);
                    }
                } else {
                    // Non-conformant but tolerated
                    warn!("pending query response without a record");
                }

                if max_results > 0
                    && !cancel_requested
                    && outcome.records.len() as u32 >= max_results
                {
                    debug!(max_results, "result cap reached; cancelling query");
                    let mut cancel =
                        CommandSet::request(CommandField::CCancelRq, channel.next_message_id());
                    cancel.responded_to = Some(message_id);
                    channel.send_command(context.id, cancel, None).await?;
                    cancel_requested = true;
                }
            }
            StatusClass::Success => {
                info!(records = outcome.records.len(), "query completed");
                return Ok(outcome);
            }
            StatusClass::Cancelled => {
                info!(records = outcome.records.len(), "query cancelled");
                outcome.cancelled = true;
                return Ok(outcome);
            }
            StatusClass::Warning => {
                warn!(status = %status, "query completed with a warning");
                return Ok(outcome);
            }
            StatusClass::Refused | StatusClass::Failed => {
                return Err(DimseError::refused(status, find_status_message(status.0)));
            }
        }
    }
}

fn find_status_message(code: u16) -> String {
    match code {
        0xA700..=0xA7FF => "refused: out of resources".to_string(),
        0xA900..=0xA9FF => "identifier does not match SOP class".to_string(),
        0xC000..=0xCFFF => "unable to process".to_string(),
        other => format!("query failed with status {:#06X}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_mask_carries_level() {
        let mask = base_mask(QueryLevel::Study);
        assert_eq!(mask.query_level(), Some("STUDY"));
    }

    #[test]
    fn test_find_status_messages() {
        assert!(find_status_message(0xA701).contains("out of resources"));
        assert!(find_status_message(0xA900).contains("does not match"));
        assert!(find_status_message(0xC123).contains("unable to process"));
    }
}
