//! Service Class User facade: one association per verb call against a
//! configured remote node.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use crate::association::{ClientAssociation, PresentationContext, RequestOutcome};
use crate::channel::DimseChannel;
use crate::codec::Codec;
use crate::config::{DimseConfig, RemoteNode};
use crate::error::{DimseError, Result};
use crate::record::Record;
use crate::transport::Connector;
use crate::uids;
use crate::verbs;
use crate::verbs::{CreateOutcome, FindOutcome, MoveOutcome, SetOutcome, StoreOutcome};

/// DIMSE Service Class User
pub struct DimseScu {
    config: DimseConfig,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn Codec>,
}

impl DimseScu {
    /// Create a new SCU with the given configuration and collaborators
    pub fn new(
        config: DimseConfig,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            config,
            connector,
            codec,
        }
    }

    /// Send a C-ECHO to a remote node
    pub async fn echo(&self, node: &RemoteNode) -> Result<bool> {
        info!("sending C-ECHO to {}@{}:{}", node.ae_title, node.host, node.port);
        let mut association = self.open(node, &[uids::VERIFICATION]).await?;
        let result = verbs::echo(&mut association).await;
        self.finish(association, result).await?;
        Ok(true)
    }

    /// Send a C-FIND to a remote node and collect the matching records
    pub async fn find(
        &self,
        node: &RemoteNode,
        sop_class: &str,
        mask: &Record,
        max_results: u32,
    ) -> Result<FindOutcome> {
        info!(
            "sending C-FIND to {}@{}:{} (max_results: {})",
            node.ae_title, node.host, node.port, max_results
        );
        let mut association = self.open(node, &[sop_class]).await?;
        let result = verbs::find(&mut association, sop_class, mask, max_results).await;
        self.finish(association, result).await
    }

    /// Send a C-FIND to a remote node and stream the matching records.
    ///
    /// The query cycle runs to completion on a background task that owns the
    /// association; results are handed out through the returned stream and
    /// the association is released (or aborted on failure) when the cycle
    /// ends.
    pub async fn find_stream(
        &self,
        node: &RemoteNode,
        sop_class: &str,
        mask: &Record,
        max_results: u32,
    ) -> Result<impl Stream<Item = Result<Record>>> {
        let mut association = self.open(node, &[sop_class]).await?;
        let sop_class = sop_class.to_string();
        let mask = mask.clone();
        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            match verbs::find(&mut association, &sop_class, &mask, max_results).await {
                Ok(outcome) => {
                    if let Err(e) = association.release().await {
                        warn!("release after query failed: {}", e);
                    }
                    for record in outcome.records {
                        if tx.send(Ok(record)).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    association.abort().await;
                    let _ = tx.send(Err(e)).await;
                }
            }
            // Dropping the sender closes the stream
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Send a C-MOVE to a remote node, directing matches to `destination`
    pub async fn move_to(
        &self,
        node: &RemoteNode,
        sop_class: &str,
        destination: &str,
        mask: &Record,
    ) -> Result<MoveOutcome> {
        info!(
            "sending C-MOVE to {}@{}:{} (dest: {})",
            node.ae_title, node.host, node.port, destination
        );
        let mut association = self.open(node, &[sop_class]).await?;
        let result = verbs::move_to(&mut association, sop_class, destination, mask).await;
        self.finish(association, result).await
    }

    /// Store a record with a remote node
    pub async fn store(&self, node: &RemoteNode, record: &Record) -> Result<StoreOutcome> {
        info!("sending C-STORE to {}@{}:{}", node.ae_title, node.host, node.port);
        let sop_class = record
            .sop_class_uid()
            .ok_or_else(|| DimseError::operation_failed("record carries no SOP class UID"))?
            .to_string();
        let mut association = self.open(node, &[sop_class.as_str()]).await?;
        let result = verbs::store(&mut association, record).await;
        self.finish(association, result).await
    }

    /// Create an object on a remote node
    pub async fn n_create(
        &self,
        node: &RemoteNode,
        sop_class: &str,
        instance_uid: Option<&str>,
        attributes: Option<&Record>,
    ) -> Result<CreateOutcome> {
        info!("sending N-CREATE to {}@{}:{}", node.ae_title, node.host, node.port);
        let mut association = self.open(node, &[sop_class]).await?;
        let result = verbs::n_create(&mut association, sop_class, instance_uid, attributes).await;
        self.finish(association, result).await
    }

    /// Modify an object on a remote node
    pub async fn n_set(
        &self,
        node: &RemoteNode,
        sop_class: &str,
        instance_uid: &str,
        modifications: &Record,
    ) -> Result<SetOutcome> {
        info!("sending N-SET to {}@{}:{}", node.ae_title, node.host, node.port);
        let mut association = self.open(node, &[sop_class]).await?;
        let result = verbs::n_set(&mut association, sop_class, instance_uid, modifications).await;
        self.finish(association, result).await
    }

    /// Test connectivity to a remote node with retry logic
    pub async fn test_connection(&self, node: &RemoteNode, max_retries: u32) -> Result<bool> {
        let mut retries = 0;

        while retries <= max_retries {
            if retries > 0 {
                info!("connection test retry {} of {}", retries, max_retries);
                tokio::time::sleep(Duration::from_secs(1 << retries)).await;
            }

            match self.echo(node).await {
                Ok(_) => {
                    info!("connection test successful");
                    return Ok(true);
                }
                Err(e) if e.is_recoverable() && retries < max_retries => {
                    warn!("connection test failed (attempt {}): {}", retries + 1, e);
                    retries += 1;
                }
                Err(e) => {
                    error!("connection test failed permanently: {}", e);
                    return Err(e);
                }
            }
        }

        Err(DimseError::operation_failed(
            "connection test failed after all retries",
        ))
    }

    /// Dial `node` and negotiate contexts for the given abstract syntaxes
    async fn open(
        &self,
        node: &RemoteNode,
        abstract_syntaxes: &[&str],
    ) -> Result<ClientAssociation> {
        let params = self.config.initiator_params(node)?;
        let connect_timeout = node
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.connect_timeout());
        let link = self
            .connector
            .connect(&node.host, node.port, connect_timeout)
            .await?;

        let contexts: Vec<PresentationContext> = abstract_syntaxes
            .iter()
            .map(|syntax| {
                PresentationContext::new(
                    (*syntax).to_string(),
                    self.config.allowed_transfer_syntaxes.clone(),
                )
            })
            .collect();

        let mut association = ClientAssociation::new(params, self.codec.clone());
        match association.request(link, contexts).await? {
            RequestOutcome::Established { .. } => {
                // The verb layer still checks its own abstract syntax; a
                // partially accepted proposal surfaces there
                Ok(association)
            }
            RequestOutcome::TimedOut => {
                Err(DimseError::timeout("association request timed out"))
            }
        }
    }

    /// Release on success, abort on failure
    async fn finish<T>(&self, mut association: ClientAssociation, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                association.release().await?;
                Ok(value)
            }
            Err(e) => {
                association.abort().await;
                Err(e)
            }
        }
    }
}

/// Builder for creating SCU instances with custom configurations
pub struct ScuBuilder {
    config: DimseConfig,
}

impl ScuBuilder {
    /// Start building a new SCU
    pub fn new() -> Self {
        Self {
            config: DimseConfig::default(),
        }
    }

    /// Set the local AE title
    pub fn local_aet(mut self, aet: impl Into<String>) -> Self {
        self.config.local_aet = aet.into();
        self
    }

    /// Set the connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the maximum PDU size
    pub fn max_pdu(mut self, size: u32) -> Self {
        self.config.max_pdu = size;
        self
    }

    /// Set the transfer syntaxes proposed for every context
    pub fn transfer_syntaxes(mut self, syntaxes: Vec<String>) -> Self {
        self.config.allowed_transfer_syntaxes = syntaxes;
        self
    }

    /// Build the SCU
    pub fn build(
        self,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn Codec>,
    ) -> Result<DimseScu> {
        self.config.validate()?;
        Ok(DimseScu::new(self.config, connector, codec))
    }
}

impl Default for ScuBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::transport::loopback::LoopbackHub;

    #[test]
    fn test_scu_builder() {
        let hub = LoopbackHub::new();
        let scu = ScuBuilder::new()
            .local_aet("TEST_SCU")
            .connection_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(2))
            .build(Arc::new(hub.connector()), Arc::new(JsonCodec))
            .unwrap();

        assert_eq!(scu.config.local_aet, "TEST_SCU");
        assert_eq!(scu.config.connect_timeout_ms, 10_000);
        assert_eq!(scu.config.read_timeout_ms, 2_000);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let hub = LoopbackHub::new();
        let result = ScuBuilder::new()
            .local_aet("")
            .build(Arc::new(hub.connector()), Arc::new(JsonCodec));
        assert!(result.is_err());
    }
}
