//! Acceptor side of an association

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{AcceptedContext, AssociationCore, State};
use crate::channel::{DimseChannel, Expected, Received, ReceiveFlags};
use crate::codec::Codec;
use crate::config::{Role, SessionParams};
use crate::error::{DimseError, Result};
use crate::record::Record;
use crate::transport::{
    AssociateAc, AssociateRq, ContextRejection, ContextResult, Pdu, RejectKind, UpperLayer,
};
use crate::types::CommandSet;
use crate::uids;

/// An association accepted by the local node (SCP side)
pub struct ServerAssociation {
    core: AssociationCore,
    proposal: Option<AssociateRq>,
}

impl ServerAssociation {
    /// Wrap an incoming session, ready to receive a proposal
    pub fn new(link: Box<dyn UpperLayer>, params: SessionParams, codec: Arc<dyn Codec>) -> Self {
        let mut core = AssociationCore::new(Role::Acceptor, params, codec);
        core.link = Some(link);
        Self {
            core,
            proposal: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> State {
        self.core.state
    }

    /// Which side this association plays
    pub fn role(&self) -> Role {
        self.core.role
    }

    /// Latched first error message, if any
    pub fn error_message(&self) -> Option<&str> {
        self.core.error_message()
    }

    /// Clear the latched error message
    pub fn clear_error(&mut self) {
        self.core.clear_error()
    }

    /// Session parameters; the peer identity is filled in once accepted
    pub fn params(&self) -> &SessionParams {
        &self.core.params
    }

    /// The received proposal, available after [`Self::receive_proposal`]
    pub fn proposal(&self) -> Option<&AssociateRq> {
        self.proposal.as_ref()
    }

    /// AE title of the proposing peer, once a proposal arrived
    pub fn calling_ae(&self) -> Option<&str> {
        self.proposal.as_ref().map(|p| p.calling_ae.as_str())
    }

    /// The accepted-context table
    pub fn accepted_contexts(&self) -> &[AcceptedContext] {
        &self.core.accepted
    }

    /// Wait up to `timeout` for the peer's association proposal.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. On success the full
    /// proposal is available through [`Self::proposal`] for inspection before
    /// an accept/reject decision.
    pub async fn receive_proposal(&mut self, timeout: Duration) -> Result<Option<&AssociateRq>> {
        if self.core.state != State::Unconnected {
            return Err(DimseError::InvalidState(format!(
                "cannot receive a proposal while {}",
                self.core.state
            )));
        }

        match self.core.recv_pdu(timeout).await {
            Ok(None) => Ok(None),
            Ok(Some(Pdu::AssociateRq(proposal))) => {
                debug!(
                    association = %self.core.id,
                    calling = %proposal.calling_ae,
                    called = %proposal.called_ae,
                    contexts = proposal.contexts.len(),
                    "received association proposal"
                );
                self.core.state = State::Negotiating;
                self.proposal = Some(proposal);
                Ok(self.proposal.as_ref())
            }
            Ok(Some(Pdu::Abort { source })) => {
                self.core
                    .latch_error(format!("aborted by peer ({:?}) before negotiation", source));
                self.core.drop_link().await;
                Err(DimseError::PeerAborted)
            }
            Ok(Some(other)) => {
                let msg = format!("unexpected {} before negotiation", other.name());
                self.core.fail(msg.clone()).await;
                Err(DimseError::protocol(msg))
            }
            Err(e) => {
                self.core.fail(format!("receive failed: {}", e)).await;
                Err(e)
            }
        }
    }

    /// Decide on the received proposal.
    ///
    /// For every proposed context whose abstract syntax is allowed, the
    /// first entry of `allowed_transfer` that was also proposed is selected,
    /// in allowed-list order. A proposal naming any application context other
    /// than the well-known identifier is permanently rejected.
    ///
    /// Returns the number of accepted contexts.
    pub async fn accept(
        &mut self,
        allowed_abstract: &[String],
        allowed_transfer: &[String],
    ) -> Result<usize> {
        if self.core.state != State::Negotiating {
            return Err(DimseError::InvalidState(format!(
                "cannot accept while {}",
                self.core.state
            )));
        }
        let proposal = self
            .proposal
            .as_ref()
            .ok_or_else(|| DimseError::internal("negotiating without a proposal"))?
            .clone();

        if proposal.application_context != uids::APPLICATION_CONTEXT {
            let msg = format!(
                "unsupported application context {}",
                proposal.application_context
            );
            warn!(association = %self.core.id, "{}", msg);
            let _ = self
                .core
                .send_pdu(Pdu::AssociateRj {
                    kind: RejectKind::Permanent,
                    reason: msg.clone(),
                })
                .await;
            self.core.latch_error(msg.clone());
            self.core.drop_link().await;
            self.core.state = State::Error;
            return Err(DimseError::AssociationRejected(msg));
        }

        let mut results = Vec::with_capacity(proposal.contexts.len());
        let mut accepted = Vec::new();
        for context in &proposal.contexts {
            if !allowed_abstract.contains(&context.abstract_syntax) {
                results.push(ContextResult::Rejected {
                    id: context.id,
                    reason: ContextRejection::AbstractSyntaxNotSupported,
                });
                continue;
            }
            // First allowed transfer syntax also proposed, in allowed order
            match allowed_transfer
                .iter()
                .find(|ts| context.transfer_syntaxes.contains(*ts))
            {
                Some(transfer_syntax) => {
                    results.push(ContextResult::Accepted {
                        id: context.id,
                        transfer_syntax: transfer_syntax.clone(),
                    });
                    accepted.push(AcceptedContext {
                        id: context.id,
                        abstract_syntax: context.abstract_syntax.clone(),
                        transfer_syntax: transfer_syntax.clone(),
                    });
                }
                None => {
                    results.push(ContextResult::Rejected {
                        id: context.id,
                        reason: ContextRejection::TransferSyntaxesNotSupported,
                    });
                }
            }
        }

        let ack = AssociateAc {
            application_context: uids::APPLICATION_CONTEXT.to_string(),
            max_pdu: self.core.params.max_pdu,
            results,
        };
        if let Err(e) = self.core.send_pdu(Pdu::AssociateAc(ack)).await {
            self.core.fail(format!("send failed: {}", e)).await;
            return Err(e);
        }

        if accepted.is_empty() {
            self.core
                .latch_error("no common presentation context with the peer");
            self.core.drop_link().await;
            self.core.state = State::Error;
            return Err(DimseError::NoCommonContext);
        }

        self.core.params.called_ae = proposal.calling_ae.clone();
        self.core.peer_max_pdu = proposal.max_pdu;
        self.core.accepted = accepted;
        self.core.state = State::Established;
        info!(
            association = %self.core.id,
            peer = %proposal.calling_ae,
            accepted = self.core.accepted.len(),
            "association accepted"
        );
        Ok(self.core.accepted.len())
    }

    /// Turn the proposal down without negotiating
    pub async fn reject(&mut self, kind: RejectKind, reason: impl Into<String>) -> Result<()> {
        if self.core.state != State::Negotiating {
            return Err(DimseError::InvalidState(format!(
                "cannot reject while {}",
                self.core.state
            )));
        }
        let reason = reason.into();
        info!(association = %self.core.id, "rejecting association: {}", reason);
        let _ = self
            .core
            .send_pdu(Pdu::AssociateRj { kind, reason })
            .await;
        self.core.drop_link().await;
        self.core.state = State::Unconnected;
        Ok(())
    }

    /// Acknowledge a peer-initiated release and return to unconnected.
    ///
    /// Valid after `receive_command` reported
    /// [`Received::ReleaseRequested`](crate::channel::Received).
    pub async fn confirm_release(&mut self) -> Result<()> {
        if self.core.state == State::Unconnected {
            return Ok(());
        }
        if self.core.state != State::Releasing {
            return Err(DimseError::InvalidState(format!(
                "no release pending while {}",
                self.core.state
            )));
        }
        if let Err(e) = self.core.send_pdu(Pdu::ReleaseRp).await {
            self.core.do_abort().await;
            return Err(e);
        }
        self.core.drop_link().await;
        self.core.accepted.clear();
        self.core.state = State::Unconnected;
        info!(association = %self.core.id, "release confirmed");
        Ok(())
    }
}

#[async_trait]
impl DimseChannel for ServerAssociation {
    fn next_message_id(&mut self) -> u16 {
        self.core.next_message_id()
    }

    fn context_for(&self, abstract_syntax: &str) -> Option<AcceptedContext> {
        self.core.context_for(abstract_syntax)
    }

    fn read_timeout(&self) -> Duration {
        self.core.params.read_timeout
    }

    async fn send_command(
        &mut self,
        context_id: u8,
        command: CommandSet,
        record: Option<&Record>,
    ) -> Result<()> {
        self.core.send_command(context_id, command, record).await
    }

    async fn receive_command(
        &mut self,
        expected: Expected,
        timeout: Duration,
        flags: ReceiveFlags,
    ) -> Result<Received> {
        self.core.receive_command(expected, timeout, flags).await
    }

    async fn receive_record(&mut self, context_id: u8) -> Result<Record> {
        self.core.receive_record(context_id).await
    }

    async fn abort(&mut self) {
        self.core.do_abort().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::config::DimseConfig;
    use crate::transport::loopback;

    fn server_with_peer() -> (ServerAssociation, loopback::LoopbackLink) {
        let (peer, link) = loopback::pair();
        let params = DimseConfig::default().acceptor_params().unwrap();
        (
            ServerAssociation::new(Box::new(link), params, Arc::new(JsonCodec)),
            peer,
        )
    }

    #[tokio::test]
    async fn test_receive_proposal_times_out() {
        let (mut server, _peer) = server_with_peer();
        let proposal = server
            .receive_proposal(Duration::from_millis(20))
            .await
            .unwrap();
        assert!(proposal.is_none());
        assert_eq!(server.state(), State::Unconnected);
    }

    #[tokio::test]
    async fn test_accept_requires_proposal() {
        let (mut server, _peer) = server_with_peer();
        let result = server.accept(&[], &[]).await;
        assert!(matches!(result, Err(DimseError::InvalidState(_))));
    }
}
