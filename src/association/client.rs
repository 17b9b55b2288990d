//! Initiator side of an association

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{AcceptedContext, AssociationCore, PresentationContext, State};
use crate::channel::{DimseChannel, Expected, Received, ReceiveFlags};
use crate::codec::Codec;
use crate::config::{Role, SessionParams};
use crate::error::{DimseError, Result};
use crate::record::Record;
use crate::transport::{AssociateRq, ContextResult, Pdu, ProposedContext, RejectKind, UpperLayer};
use crate::types::CommandSet;
use crate::{uids, MAX_PROPOSED_CONTEXTS};

/// Outcome of an association request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The peer accepted the association with this many contexts
    Established {
        /// Number of accepted presentation contexts
        accepted: usize,
    },
    /// The peer did not answer within the read timeout; the caller may retry
    TimedOut,
}

/// An association driven by the local node (SCU side)
pub struct ClientAssociation {
    core: AssociationCore,
    contexts: Vec<PresentationContext>,
}

impl ClientAssociation {
    /// Create an unconnected initiator association
    pub fn new(params: SessionParams, codec: Arc<dyn Codec>) -> Self {
        Self {
            core: AssociationCore::new(Role::Initiator, params, codec),
            contexts: Vec::new(),
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

    /// Session parameters this association was built with
    pub fn params(&self) -> &SessionParams {
        &self.core.params
    }

    /// The proposed contexts with their negotiated outcomes
    pub fn contexts(&self) -> &[PresentationContext] {
        &self.contexts
    }

    /// The accepted-context table
    pub fn accepted_contexts(&self) -> &[AcceptedContext] {
        &self.core.accepted
    }

    /// Negotiate an association over `link`, proposing `contexts`.
    ///
    /// Returns the number of accepted contexts on success. A read timeout
    /// while negotiating is a distinguished outcome, not an error state;
    /// the association returns to unconnected and may be retried.
    pub async fn request(
        &mut self,
        link: Box<dyn UpperLayer>,
        mut contexts: Vec<PresentationContext>,
    ) -> Result<RequestOutcome> {
        if self.core.state != State::Unconnected {
            return Err(DimseError::InvalidState(format!(
                "cannot request while {}",
                self.core.state
            )));
        }
        if contexts.is_empty() {
            return Err(DimseError::config("no presentation contexts to propose"));
        }
        if contexts.len() > MAX_PROPOSED_CONTEXTS {
            return Err(DimseError::config(format!(
                "at most {} presentation contexts may be proposed",
                MAX_PROPOSED_CONTEXTS
            )));
        }

        // Odd ids in proposal order
        for (i, context) in contexts.iter_mut().enumerate() {
            context.id = (2 * i + 1) as u8;
        }
        let proposals: Vec<ProposedContext> = contexts
            .iter()
            .map(|c| ProposedContext {
                id: c.id,
                abstract_syntax: c.abstract_syntax.clone(),
                transfer_syntaxes: c.transfer_syntaxes.clone(),
            })
            .collect();

        self.contexts = contexts;
        self.core.link = Some(link);
        self.core.state = State::Negotiating;

        info!(
            association = %self.core.id,
            calling = %self.core.params.calling_ae,
            called = %self.core.params.called_ae,
            contexts = proposals.len(),
            "requesting association"
        );

        let request = AssociateRq {
            calling_ae: self.core.params.calling_ae.clone(),
            called_ae: self.core.params.called_ae.clone(),
            application_context: uids::APPLICATION_CONTEXT.to_string(),
            max_pdu: self.core.params.max_pdu,
            contexts: proposals,
        };
        if let Err(e) = self.core.send_pdu(Pdu::AssociateRq(request)).await {
            self.core.fail(format!("send failed: {}", e)).await;
            return Err(e);
        }

        let timeout = self.core.params.read_timeout;
        match self.core.recv_pdu(timeout).await {
            Ok(None) => {
                debug!(association = %self.core.id, "negotiation timed out");
                self.core.drop_link().await;
                self.core.state = State::Unconnected;
                Ok(RequestOutcome::TimedOut)
            }
            Ok(Some(Pdu::AssociateAc(ac))) => {
                if ac.application_context != uids::APPLICATION_CONTEXT {
                    let msg = format!(
                        "peer answered with application context {}",
                        ac.application_context
                    );
                    self.core.fail(msg.clone()).await;
                    return Err(DimseError::protocol(msg));
                }

                let mut accepted = Vec::new();
                for result in &ac.results {
                    let context = self
                        .contexts
                        .iter_mut()
                        .find(|c| c.id == result.id());
                    let Some(context) = context else {
                        let msg = format!("reply names unknown context {}", result.id());
                        self.core.fail(msg.clone()).await;
                        return Err(DimseError::protocol(msg));
                    };
                    if let ContextResult::Accepted {
                        transfer_syntax, ..
                    } = result
                    {
                        if !context.record_acceptance(transfer_syntax) {
                            let msg = format!(
                                "reply selected unproposed transfer syntax {}",
                                transfer_syntax
                            );
                            self.core.fail(msg.clone()).await;
                            return Err(DimseError::protocol(msg));
                        }
                        accepted.push(AcceptedContext {
                            id: context.id,
                            abstract_syntax: context.abstract_syntax.clone(),
                            transfer_syntax: transfer_syntax.clone(),
                        });
                    }
                }

                if accepted.is_empty() {
                    self.core
                        .latch_error("no presentation context was accepted");
                    self.core.drop_link().await;
                    self.core.state = State::Error;
                    return Err(DimseError::NoCommonContext);
                }

                self.core.peer_max_pdu = ac.max_pdu;
                self.core.accepted = accepted;
                self.core.state = State::Established;
                info!(
                    association = %self.core.id,
                    accepted = self.core.accepted.len(),
                    "association established"
                );
                Ok(RequestOutcome::Established {
                    accepted: self.core.accepted.len(),
                })
            }
            Ok(Some(Pdu::AssociateRj { kind, reason })) => {
                let msg = format!(
                    "association rejected ({}): {}",
                    match kind {
                        RejectKind::Permanent => "permanent",
                        RejectKind::Transient => "transient",
                    },
                    reason
                );
                warn!(association = %self.core.id, "{}", msg);
                self.core.latch_error(msg.clone());
                self.core.drop_link().await;
                self.core.state = State::Error;
                Err(DimseError::AssociationRejected(msg))
            }
            Ok(Some(Pdu::Abort { source })) => {
                self.core
                    .latch_error(format!("aborted by peer ({:?}) during negotiation", source));
                self.core.drop_link().await;
                self.core.state = State::Unconnected;
                Err(DimseError::PeerAborted)
            }
            Ok(Some(other)) => {
                let msg = format!("unexpected {} while negotiating", other.name());
                self.core.fail(msg.clone()).await;
                Err(DimseError::protocol(msg))
            }
            Err(e) => {
                self.core.fail(format!("receive failed: {}", e)).await;
                Err(e)
            }
        }
    }

    /// Release the association in an orderly fashion.
    ///
    /// A no-op when the association is already unconnected. On a protocol
    /// failure during release the association escalates to an abort.
    pub async fn release(&mut self) -> Result<()> {
        match self.core.state {
            State::Unconnected => return Ok(()),
            State::Established => {}
            other => {
                return Err(DimseError::InvalidState(format!(
                    "cannot release while {}",
                    other
                )))
            }
        }

        self.core.state = State::Releasing;
        if let Err(e) = self.core.send_pdu(Pdu::ReleaseRq).await {
            self.core.do_abort().await;
            return Err(e);
        }

        let deadline = std::time::Instant::now() + self.core.params.read_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.core.recv_pdu(remaining).await {
                Ok(None) => {
                    self.core.do_abort().await;
                    return Err(DimseError::timeout("release was not confirmed"));
                }
                Ok(Some(Pdu::ReleaseRp)) => {
                    self.core.drop_link().await;
                    self.core.accepted.clear();
                    self.core.state = State::Unconnected;
                    info!(association = %self.core.id, "association released");
                    return Ok(());
                }
                // Straggler responses already in flight are drained silently
                Ok(Some(Pdu::PData { .. })) => continue,
                Ok(Some(Pdu::Abort { source })) => {
                    self.core
                        .latch_error(format!("aborted by peer ({:?}) during release", source));
                    self.core.drop_link().await;
                    self.core.state = State::Unconnected;
                    return Err(DimseError::PeerAborted);
                }
                Ok(Some(other)) => {
                    let msg = format!("unexpected {} during release", other.name());
                    self.core.latch_error(msg.clone());
                    self.core.do_abort().await;
                    return Err(DimseError::protocol(msg));
                }
                Err(e) => {
                    self.core.do_abort().await;
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl DimseChannel for ClientAssociation {
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
