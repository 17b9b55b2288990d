//! Retrieve service (C-MOVE)

use dicom_dictionary_std::tags;
use tracing::{debug, info, warn};

use crate::channel::{DimseChannel, Expected, ReceiveFlags};
use crate::error::{DimseError, Result};
use crate::record::Record;
use crate::types::{CommandField, CommandSet, Priority, Status, StatusClass};

/// Result of a retrieve cycle
#[derive(Debug, Clone, Default)]
pub struct MoveOutcome {
    /// Sub-operations completed by the peer
    pub completed: u16,
    /// Sub-operations that failed
    pub failed: u16,
    /// Sub-operations that completed with warnings
    pub warned: u16,
    /// Whether the cycle ended with a cancelled status
    pub cancelled: bool,
    /// Final status reported by the peer
    pub status: Status,
    /// Identifiers of failed instances, when the peer attached them
    pub failed_instances: Vec<String>,
}

/// Run one retrieve cycle, asking the peer to move matches to
/// `destination`.
///
/// Pending responses carry sub-operation counts rather than records. On a
/// failure status the attached failed-instance list, if any, is parsed
/// opportunistically before the error is raised.
pub async fn move_to<C: DimseChannel + ?Sized>(
    channel: &mut C,
    sop_class: &str,
    destination: &str,
    mask: &Record,
) -> Result<MoveOutcome> {
    if destination.is_empty() || destination.len() > 16 {
        return Err(DimseError::InvalidAeTitle(
            "move destination must be 1-16 characters".to_string(),
        ));
    }
    let context = channel
        .context_for(sop_class)
        .ok_or_else(|| DimseError::NoAcceptedContext(sop_class.to_string()))?;

    let message_id = channel.next_message_id();
    let request = CommandSet::request(CommandField::CMoveRq, message_id)
        .with_sop_class(sop_class)
        .with_priority(Priority::Medium)
        .with_move_destination(destination);
    channel.send_command(context.id, request, Some(mask)).await?;

    let mut outcome = MoveOutcome::default();
    loop {
        let timeout = channel.read_timeout();
        let received = channel
            .receive_command(
                Expected::Only(CommandField::CMoveRsp),
                timeout,
                ReceiveFlags::default(),
            )
            .await?;
        let (context_id, response) = super::response_to(channel, received, message_id).await?;

        outcome.completed = response.completed.unwrap_or(outcome.completed);
        outcome.failed = response.failed.unwrap_or(outcome.failed);
        outcome.warned = response.warned.unwrap_or(outcome.warned);

        let status = response.status();
        outcome.status = status;
        match status.class() {
            StatusClass::Pending => {
                debug!(
                    remaining = response.remaining.unwrap_or_default(),
                    completed = outcome.completed,
                    "retrieve in progress"
                );
                if response.has_dataset {
                    // Not expected on a pending retrieve response; drain it
                    let stray = channel.receive_record(context_id).await?;
                    warn!(
                        elements = stray.len(),
                        "ignoring record attached to pending retrieve response"
                    );
                }
            }
            StatusClass::Success => {
                info!(
                    completed = outcome.completed,
                    failed = outcome.failed,
                    warned = outcome.warned,
                    "retrieve completed"
                );
                return Ok(outcome);
            }
            StatusClass::Cancelled => {
                info!(completed = outcome.completed, "retrieve cancelled");
                outcome.cancelled = true;
                return Ok(outcome);
            }
            StatusClass::Warning => {
                // Sub-operations completed, one or more failures
                if response.has_dataset {
                    let record = channel.receive_record(context_id).await?;
                    outcome.failed_instances = failed_instances(&record);
                }
                warn!(
                    failed = outcome.failed,
                    instances = outcome.failed_instances.len(),
                    "retrieve completed with failures"
                );
                return Ok(outcome);
            }
            StatusClass::Refused | StatusClass::Failed => {
                if response.has_dataset {
                    let record = channel.receive_record(context_id).await?;
                    outcome.failed_instances = failed_instances(&record);
                    if !outcome.failed_instances.is_empty() {
                        warn!(
                            instances = ?outcome.failed_instances,
                            "peer reported failed instances"
                        );
                    }
                }
                return Err(DimseError::refused(status, move_status_message(status.0)));
            }
        }
    }
}

/// Pull the failed-instance list out of a response record, if present
fn failed_instances(record: &Record) -> Vec<String> {
    record
        .strings(tags::FAILED_SOP_INSTANCE_UID_LIST)
        .map(|values| values.iter().filter(|v| !v.is_empty()).cloned().collect())
        .unwrap_or_default()
}

fn move_status_message(code: u16) -> String {
    match code {
        0xA701 => "refused: out of resources, cannot calculate matches".to_string(),
        0xA702 => "refused: out of resources, cannot perform sub-operations".to_string(),
        0xA801 => "refused: move destination unknown".to_string(),
        0xA900..=0xA9FF => "identifier does not match SOP class".to_string(),
        0xC000..=0xCFFF => "unable to process".to_string(),
        other => format!("retrieve failed with status {:#06X}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::VR;

    #[test]
    fn test_failed_instance_list_parsing() {
        let mut record = Record::new();
        record.put_str(
            tags::FAILED_SOP_INSTANCE_UID_LIST,
            VR::UI,
            "1.2.3\\4.5.6",
        );
        assert_eq!(failed_instances(&record), vec!["1.2.3", "4.5.6"]);
        assert!(failed_instances(&Record::new()).is_empty());
    }

    #[test]
    fn test_move_status_messages() {
        assert!(move_status_message(0xA801).contains("destination unknown"));
        assert!(move_status_message(0xC001).contains("unable to process"));
    }

    #[tokio::test]
    async fn test_destination_validated_before_network() {
        struct NoChannel;
        #[async_trait::async_trait]
        impl DimseChannel for NoChannel {
            fn next_message_id(&mut self) -> u16 {
                unreachable!()
            }
            fn context_for(&self, _: &str) -> Option<crate::association::AcceptedContext> {
                None
            }
            fn read_timeout(&self) -> std::time::Duration {
                std::time::Duration::from_secs(1)
            }
            async fn send_command(
                &mut self,
                _: u8,
                _: CommandSet,
                _: Option<&Record>,
            ) -> Result<()> {
                unreachable!()
            }
            async fn receive_command(
                &mut self,
                _: Expected,
                _: std::time::Duration,
                _: ReceiveFlags,
            ) -> Result<crate::channel::Received> {
                unreachable!()
            }
            async fn receive_record(&mut self, _: u8) -> Result<Record> {
                unreachable!()
            }
            async fn abort(&mut self) {}
        }

        let mut channel = NoChannel;
        let result = move_to(&mut channel, crate::uids::STUDY_ROOT_QR_MOVE, "", &Record::new()).await;
        assert!(matches!(result, Err(DimseError::InvalidAeTitle(_))));
    }
}
