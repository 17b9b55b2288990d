//! Service Class Provider: per-session workers dispatching inbound DIMSE
//! requests against a data source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::association::ServerAssociation;
use crate::channel::{DimseChannel, Expected, Received, ReceiveFlags};
use crate::codec::Codec;
use crate::config::DimseConfig;
use crate::error::{DimseError, Result};
use crate::listener::AssociationListener;
use crate::matching::match_record;
use crate::record::Record;
use crate::transport::SessionAcceptor;
use crate::types::{CommandField, CommandSet, Status};
use dicom_core::VR;
use dicom_dictionary_std::tags;

/// Interval for the cancel poll between query responses
const CANCEL_POLL: Duration = Duration::from_millis(1);

/// Query/store backend the provider serves from
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Number of records held
    async fn count(&self) -> Result<usize>;

    /// Record at position `index`
    async fn record_at(&self, index: usize) -> Result<Record>;

    /// Store a record
    async fn store(&self, record: Record) -> Result<()>;
}

/// Data source backed by an in-memory list of records
pub struct InMemoryDataSource {
    records: RwLock<Vec<Record>>,
}

impl InMemoryDataSource {
    /// Create an empty data source
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    /// Create a data source holding `records`
    pub fn with_records(records: Vec<Record>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }
}

impl Default for InMemoryDataSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSource for InMemoryDataSource {
    async fn count(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }

    async fn record_at(&self, index: usize) -> Result<Record> {
        self.records
            .read()
            .await
            .get(index)
            .cloned()
            .ok_or_else(|| DimseError::operation_failed(format!("no record at index {}", index)))
    }

    async fn store(&self, record: Record) -> Result<()> {
        let mut records = self.records.write().await;
        // Same instance identity replaces the stored record
        if let Some(uid) = record.sop_instance_uid() {
            if let Some(existing) = records
                .iter_mut()
                .find(|r| r.sop_instance_uid() == Some(uid))
            {
                *existing = record;
                return Ok(());
            }
        }
        records.push(record);
        Ok(())
    }
}

/// DIMSE Service Class Provider
pub struct DimseScp {
    config: DimseConfig,
    data_source: Arc<dyn DataSource>,
    active_associations: Arc<RwLock<u32>>,
}

impl DimseScp {
    /// Create a new provider with the given configuration and data source
    pub fn new(config: DimseConfig, data_source: Arc<dyn DataSource>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            data_source,
            active_associations: Arc::new(RwLock::new(0)),
        })
    }

    /// Accept and serve associations until the task is cancelled
    pub async fn run(
        self,
        acceptor: Box<dyn SessionAcceptor>,
        codec: Arc<dyn Codec>,
    ) -> Result<()> {
        let mut listener =
            AssociationListener::spawn(self.config.clone(), acceptor, codec)?;
        info!(aet = %self.config.local_aet, "DIMSE SCP serving");

        let scp = Arc::new(self);
        loop {
            while let Some(event) = listener.try_event() {
                warn!(peer = %event.peer, "incoming association failed: {}", event.error);
            }
            match listener.take(Duration::from_secs(1)).await {
                Ok(None) => continue,
                Ok(Some(mut association)) => {
                    {
                        let active = scp.active_associations.read().await;
                        if *active >= scp.config.max_associations {
                            warn!(
                                peer = ?association.calling_ae(),
                                "maximum associations reached; aborting"
                            );
                            association.abort().await;
                            continue;
                        }
                    }
                    let scp = Arc::clone(&scp);
                    tokio::spawn(async move {
                        let session = Uuid::new_v4();
                        *scp.active_associations.write().await += 1;
                        if let Err(e) = scp.handle_association(association).await {
                            error!(session = %session, "association worker failed: {}", e);
                        }
                        *scp.active_associations.write().await -= 1;
                    });
                }
                Err(e) => {
                    error!("listener stopped: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Serve one established association until release, abort, or failure.
    ///
    /// The worker owns the association exclusively for the remainder of the
    /// session.
    pub async fn handle_association(&self, mut association: ServerAssociation) -> Result<()> {
        let peer = association.params().called_ae.clone();
        info!(peer = %peer, "session worker started");

        loop {
            let received = association
                .receive_command(
                    Expected::Any,
                    self.config.read_timeout(),
                    ReceiveFlags::lenient(),
                )
                .await;
            match received {
                Ok(Received::TimedOut) => {
                    // Idle session; keep waiting
                    continue;
                }
                Ok(Received::ReleaseRequested) => {
                    association.confirm_release().await?;
                    info!(peer = %peer, "session released");
                    return Ok(());
                }
                Ok(Received::Command {
                    context_id,
                    command,
                }) => {
                    self.dispatch(&mut association, context_id, command).await?;
                }
                Err(DimseError::PeerAborted) => {
                    info!(peer = %peer, "session aborted by peer");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch(
        &self,
        association: &mut ServerAssociation,
        context_id: u8,
        command: CommandSet,
    ) -> Result<()> {
        debug!(command = %command.field, message_id = command.message_id, "dispatching");
        match command.field {
            CommandField::CEchoRq => self.handle_echo(association, context_id, command).await,
            CommandField::CFindRq => self.handle_find(association, context_id, command).await,
            CommandField::CStoreRq => self.handle_store(association, context_id, command).await,
            CommandField::CMoveRq => self.handle_move(association, context_id, command).await,
            CommandField::NCreateRq => self.handle_create(association, context_id, command).await,
            CommandField::NSetRq => self.handle_set(association, context_id, command).await,
            CommandField::CCancelRq => {
                // No operation in flight to cancel
                debug!("ignoring stray cancel request");
                Ok(())
            }
            other => {
                let msg = format!("peer sent {} to a provider", other);
                association.abort().await;
                Err(DimseError::protocol(msg))
            }
        }
    }

    async fn respond(
        &self,
        association: &mut ServerAssociation,
        context_id: u8,
        request: &CommandSet,
        status: Status,
    ) -> Result<()> {
        let response = CommandSet::response(request, status);
        association.send_command(context_id, response, None).await
    }

    /// Drain the dataset announced by a request we are about to refuse
    async fn drain_dataset(
        &self,
        association: &mut ServerAssociation,
        context_id: u8,
        command: &CommandSet,
    ) -> Result<Option<Record>> {
        if command.has_dataset {
            Ok(Some(association.receive_record(context_id).await?))
        } else {
            Ok(None)
        }
    }

    async fn handle_echo(
        &self,
        association: &mut ServerAssociation,
        context_id: u8,
        command: CommandSet,
    ) -> Result<()> {
        if !self.config.enable_echo {
            return self
                .respond(
                    association,
                    context_id,
                    &command,
                    Status::SOP_CLASS_NOT_SUPPORTED,
                )
                .await;
        }
        self.respond(association, context_id, &command, Status::SUCCESS)
            .await
    }

    async fn handle_find(
        &self,
        association: &mut ServerAssociation,
        context_id: u8,
        command: CommandSet,
    ) -> Result<()> {
        let mask = self.drain_dataset(association, context_id, &command).await?;
        if !self.config.enable_find {
            return self
                .respond(
                    association,
                    context_id,
                    &command,
                    Status::SOP_CLASS_NOT_SUPPORTED,
                )
                .await;
        }
        let Some(mut mask) = mask else {
            warn!("query request without an identifier");
            return self
                .respond(association, context_id, &command, Status::UNABLE_TO_PROCESS)
                .await;
        };
        // The retrieve level steers the query, it is not a matching key
        if let Some(level) = mask.remove(tags::QUERY_RETRIEVE_LEVEL) {
            debug!(level = ?level.first_str(), "query level");
        }

        let count = match self.data_source.count().await {
            Ok(count) => count,
            Err(e) => {
                error!("data source failed: {}", e);
                return self
                    .respond(association, context_id, &command, Status::UNABLE_TO_PROCESS)
                    .await;
            }
        };

        let mut matches = 0usize;
        for index in 0..count {
            if self.cancel_requested(association, &command).await? {
                info!(matches, "query cancelled by peer");
                return self
                    .respond(association, context_id, &command, Status::CANCELLED)
                    .await;
            }

            let candidate = match self.data_source.record_at(index).await {
                Ok(candidate) => candidate,
                Err(e) => {
                    error!("data source failed: {}", e);
                    return self
                        .respond(association, context_id, &command, Status::UNABLE_TO_PROCESS)
                        .await;
                }
            };
            if let Some(result) = match_record(&mask, &candidate) {
                let response = CommandSet::response(&command, Status::PENDING);
                association
                    .send_command(context_id, response, Some(&result))
                    .await?;
                matches += 1;
            }
        }

        debug!(matches, candidates = count, "query finished");
        self.respond(association, context_id, &command, Status::SUCCESS)
            .await
    }

    /// Cooperative cancel: between responses, peek for a C-CANCEL-RQ
    async fn cancel_requested(
        &self,
        association: &mut ServerAssociation,
        request: &CommandSet,
    ) -> Result<bool> {
        let flags = ReceiveFlags {
            allow_timeout: true,
            allow_release: false,
        };
        match association
            .receive_command(Expected::Any, CANCEL_POLL, flags)
            .await?
        {
            Received::TimedOut => Ok(false),
            Received::Command { command, .. } if command.field == CommandField::CCancelRq => {
                if command.responded_to != Some(request.message_id) {
                    warn!(
                        responded_to = ?command.responded_to,
                        "cancel names a different operation; honoring it anyway"
                    );
                }
                Ok(true)
            }
            Received::Command { command, .. } => {
                let msg = format!("peer sent {} during a query", command.field);
                association.abort().await;
                Err(DimseError::protocol(msg))
            }
            Received::ReleaseRequested => {
                // Unreachable with allow_release = false
                Err(DimseError::internal("release surfaced during cancel poll"))
            }
        }
    }

    async fn handle_store(
        &self,
        association: &mut ServerAssociation,
        context_id: u8,
        command: CommandSet,
    ) -> Result<()> {
        let record = self.drain_dataset(association, context_id, &command).await?;
        if !self.config.enable_store {
            return self
                .respond(
                    association,
                    context_id,
                    &command,
                    Status::SOP_CLASS_NOT_SUPPORTED,
                )
                .await;
        }
        let Some(record) = record else {
            warn!("store request without a record");
            return self
                .respond(association, context_id, &command, Status::UNABLE_TO_PROCESS)
                .await;
        };

        // The stored object must carry the identity the command announced
        if record.sop_class_uid() != command.sop_class_uid.as_deref() {
            return self
                .respond(association, context_id, &command, Status(0xA900))
                .await;
        }

        match self.data_source.store(record).await {
            Ok(()) => {
                self.respond(association, context_id, &command, Status::SUCCESS)
                    .await
            }
            Err(e) => {
                error!("store failed: {}", e);
                self.respond(association, context_id, &command, Status(0xA700))
                    .await
            }
        }
    }

    async fn handle_move(
        &self,
        association: &mut ServerAssociation,
        context_id: u8,
        command: CommandSet,
    ) -> Result<()> {
        let mask = self.drain_dataset(association, context_id, &command).await?;
        if !self.config.enable_move {
            return self
                .respond(
                    association,
                    context_id,
                    &command,
                    Status::SOP_CLASS_NOT_SUPPORTED,
                )
                .await;
        }
        let Some(mut mask) = mask else {
            warn!("retrieve request without an identifier");
            return self
                .respond(association, context_id, &command, Status::UNABLE_TO_PROCESS)
                .await;
        };
        mask.remove(tags::QUERY_RETRIEVE_LEVEL);
        let destination = command.move_destination.clone().unwrap_or_default();
        if destination.is_empty() || destination.len() > 16 {
            return self
                .respond(association, context_id, &command, Status(0xA801))
                .await;
        }

        // Resolve the matching instances; dispatching the store
        // sub-operations to the destination is the deployment's concern
        let count = match self.data_source.count().await {
            Ok(count) => count,
            Err(e) => {
                error!("data source failed: {}", e);
                return self
                    .respond(association, context_id, &command, Status::UNABLE_TO_PROCESS)
                    .await;
            }
        };
        let mut resolved = Vec::new();
        for index in 0..count {
            let candidate = match self.data_source.record_at(index).await {
                Ok(candidate) => candidate,
                Err(e) => {
                    error!("data source failed: {}", e);
                    return self
                        .respond(association, context_id, &command, Status::UNABLE_TO_PROCESS)
                        .await;
                }
            };
            if match_record(&mask, &candidate).is_some() {
                resolved.push(candidate);
            }
        }

        let total = resolved.len() as u16;
        let mut completed = 0u16;
        for _record in resolved {
            if self.cancel_requested(association, &command).await? {
                info!(completed, "retrieve cancelled by peer");
                let response = CommandSet::response(&command, Status::CANCELLED)
                    .with_sub_operations(total - completed, completed, 0, 0);
                return association.send_command(context_id, response, None).await;
            }
            completed += 1;
            let response = CommandSet::response(&command, Status::PENDING)
                .with_sub_operations(total - completed, completed, 0, 0);
            association.send_command(context_id, response, None).await?;
        }

        info!(destination = %destination, completed, "retrieve finished");
        let response = CommandSet::response(&command, Status::SUCCESS)
            .with_sub_operations(0, completed, 0, 0);
        association.send_command(context_id, response, None).await
    }

    async fn handle_create(
        &self,
        association: &mut ServerAssociation,
        context_id: u8,
        command: CommandSet,
    ) -> Result<()> {
        let attributes = self.drain_dataset(association, context_id, &command).await?;
        if !self.config.enable_object {
            return self
                .respond(
                    association,
                    context_id,
                    &command,
                    Status::SOP_CLASS_NOT_SUPPORTED,
                )
                .await;
        }
        let Some(sop_class) = command.sop_class_uid.clone() else {
            return self
                .respond(association, context_id, &command, Status(0x0118))
                .await;
        };

        let requested_uid = command.sop_instance_uid.clone();
        let instance_uid = requested_uid
            .clone()
            .unwrap_or_else(|| format!("2.25.{}", Uuid::new_v4().as_u128()));

        if self.instance_exists(&instance_uid).await? {
            return self
                .respond(association, context_id, &command, Status(0x0111))
                .await;
        }

        let mut record = attributes.unwrap_or_default();
        record.put_str(tags::SOP_CLASS_UID, VR::UI, sop_class);
        record.put_str(tags::SOP_INSTANCE_UID, VR::UI, instance_uid.clone());

        match self.data_source.store(record.clone()).await {
            Ok(()) => {
                info!(instance_uid = %instance_uid, "object created");
                let mut response = CommandSet::response(&command, Status::SUCCESS);
                // Name the UID only when this side assigned it
                if requested_uid.is_none() {
                    response = response.with_sop_instance(instance_uid);
                }
                association
                    .send_command(context_id, response, Some(&record))
                    .await
            }
            Err(e) => {
                error!("create failed: {}", e);
                self.respond(association, context_id, &command, Status::PROCESSING_FAILURE)
                    .await
            }
        }
    }

    async fn handle_set(
        &self,
        association: &mut ServerAssociation,
        context_id: u8,
        command: CommandSet,
    ) -> Result<()> {
        let modifications = self.drain_dataset(association, context_id, &command).await?;
        if !self.config.enable_object {
            return self
                .respond(
                    association,
                    context_id,
                    &command,
                    Status::SOP_CLASS_NOT_SUPPORTED,
                )
                .await;
        }
        let Some(modifications) = modifications else {
            return self
                .respond(association, context_id, &command, Status(0x0120))
                .await;
        };
        let Some(instance_uid) = command.sop_instance_uid.clone() else {
            return self
                .respond(association, context_id, &command, Status(0x0112))
                .await;
        };

        let Some(existing) = self.find_instance(&instance_uid).await? else {
            return self
                .respond(association, context_id, &command, Status(0x0112))
                .await;
        };

        let mut merged = existing;
        for (tag, element) in modifications.iter() {
            merged.put(*tag, element.clone());
        }

        match self.data_source.store(merged.clone()).await {
            Ok(()) => {
                info!(instance_uid = %instance_uid, "object modified");
                let response =
                    CommandSet::response(&command, Status::SUCCESS).with_sop_instance(instance_uid);
                association
                    .send_command(context_id, response, Some(&merged))
                    .await
            }
            Err(e) => {
                error!("modify failed: {}", e);
                self.respond(association, context_id, &command, Status::PROCESSING_FAILURE)
                    .await
            }
        }
    }

    async fn instance_exists(&self, instance_uid: &str) -> Result<bool> {
        Ok(self.find_instance(instance_uid).await?.is_some())
    }

    async fn find_instance(&self, instance_uid: &str) -> Result<Option<Record>> {
        let count = self.data_source.count().await?;
        for index in 0..count {
            let record = self.data_source.record_at(index).await?;
            if record.sop_instance_uid() == Some(instance_uid) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_uid(uid: &str) -> Record {
        let mut record = Record::new();
        record.put_str(tags::SOP_INSTANCE_UID, VR::UI, uid);
        record
    }

    #[tokio::test]
    async fn test_in_memory_data_source() {
        let source = InMemoryDataSource::new();
        assert_eq!(source.count().await.unwrap(), 0);

        source.store(record_with_uid("1.2.3")).await.unwrap();
        source.store(record_with_uid("4.5.6")).await.unwrap();
        assert_eq!(source.count().await.unwrap(), 2);
        assert_eq!(
            source.record_at(0).await.unwrap().sop_instance_uid(),
            Some("1.2.3")
        );
        assert!(source.record_at(5).await.is_err());
    }

    #[tokio::test]
    async fn test_store_replaces_same_instance() {
        let source = InMemoryDataSource::new();
        let mut first = record_with_uid("1.2.3");
        first.put_str(tags::PATIENT_ID, VR::LO, "OLD");
        source.store(first).await.unwrap();

        let mut second = record_with_uid("1.2.3");
        second.put_str(tags::PATIENT_ID, VR::LO, "NEW");
        source.store(second).await.unwrap();

        assert_eq!(source.count().await.unwrap(), 1);
        assert_eq!(
            source.record_at(0).await.unwrap().first_str(tags::PATIENT_ID),
            Some("NEW")
        );
    }

    #[tokio::test]
    async fn test_scp_validates_config() {
        let config = DimseConfig {
            local_aet: String::new(),
            ..Default::default()
        };
        assert!(DimseScp::new(config, Arc::new(InMemoryDataSource::new())).is_err());
    }
}
