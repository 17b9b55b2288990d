//! Storage service (C-STORE)

use tracing::{info, warn};

use crate::channel::{DimseChannel, Expected, ReceiveFlags};
use crate::error::{DimseError, Result};
use crate::record::Record;
use crate::types::{CommandField, CommandSet, Priority, Status};

/// Result of a storage cycle
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    /// Final status reported by the peer
    pub status: Status,
    /// Set when the peer stored the record with a warning
    pub warning: Option<String>,
}

/// Store `record` with the peer.
///
/// The record's own SOP class identity selects the presentation context.
/// Warning sub-ranges (coercion of values, elements discarded, data-set
/// mismatch) are accepted with a logged warning; refusals and errors raise.
pub async fn store<C: DimseChannel + ?Sized>(
    channel: &mut C,
    record: &Record,
) -> Result<StoreOutcome> {
    let sop_class = record
        .sop_class_uid()
        .ok_or_else(|| DimseError::operation_failed("record carries no SOP class UID"))?
        .to_string();
    let sop_instance = record
        .sop_instance_uid()
        .ok_or_else(|| DimseError::operation_failed("record carries no SOP instance UID"))?
        .to_string();

    let context = channel
        .context_for(&sop_class)
        .ok_or_else(|| DimseError::NoAcceptedContext(sop_class.clone()))?;

    let message_id = channel.next_message_id();
    let request = CommandSet::request(CommandField::CStoreRq, message_id)
        .with_sop_class(&sop_class)
        .with_sop_instance(&sop_instance)
        .with_priority(Priority::Medium);
    channel
        .send_command(context.id, request, Some(record))
        .await?;

    let timeout = channel.read_timeout();
    let received = channel
        .receive_command(
            Expected::Only(CommandField::CStoreRsp),
            timeout,
            ReceiveFlags::default(),
        )
        .await?;
    let (_, response) = super::response_to(channel, received, message_id).await?;

    let status = response.status();
    match status.0 {
        0x0000 => {
            info!(sop_instance = %sop_instance, "store completed");
            Ok(StoreOutcome {
                status,
                warning: None,
            })
        }
        // Warning sub-ranges: stored, but degraded
        0xB000 => accept_with_warning(status, "coercion of data element values"),
        0xB006 => accept_with_warning(status, "elements discarded"),
        0xB007 => accept_with_warning(status, "data set does not match SOP class"),
        0xA700..=0xA7FF => Err(DimseError::refused(
            status,
            "refused: out of resources".to_string(),
        )),
        0xA900..=0xA9FF => Err(DimseError::refused(
            status,
            "error: data set does not match SOP class".to_string(),
        )),
        0xC000..=0xCFFF => Err(DimseError::refused(
            status,
            "error: cannot understand".to_string(),
        )),
        other => Err(DimseError::refused(
            status,
            format!("store failed with status {:#06X}", other),
        )),
    }
}

fn accept_with_warning(status: Status, message: &str) -> Result<StoreOutcome> {
    warn!(status = %status, "store completed with warning: {}", message);
    Ok(StoreOutcome {
        status,
        warning: Some(message.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::VR;
    use dicom_dictionary_std::tags;

    #[test]
    fn test_warning_acceptance() {
        let outcome = accept_with_warning(Status(0xB000), "coercion of data element values");
        let outcome = outcome.unwrap();
        assert_eq!(outcome.status, Status(0xB000));
        assert!(outcome.warning.unwrap().contains("coercion"));
    }

    #[tokio::test]
    async fn test_store_requires_identity_fields() {
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
        let mut record = Record::new();
        assert!(store(&mut channel, &record).await.is_err());

        record.put_str(tags::SOP_CLASS_UID, VR::UI, "1.2.840.10008.5.1.4.1.1.7");
        // Still lacks the instance UID
        assert!(store(&mut channel, &record).await.is_err());
    }
}
