//! Association state machine shared by both roles.
//!
//! The initiator and acceptor specializations live in [`client`] and
//! [`server`]; the state handling, message-ID allocation, error latch and
//! P-DATA assembly they share live here.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{Expected, Received, ReceiveFlags};
use crate::codec::Codec;
use crate::config::{Role, SessionParams};
use crate::error::{DimseError, Result};
use crate::record::Record;
use crate::transport::{AbortSource, PDataValue, Pdu, UpperLayer};
use crate::types::CommandSet;

pub mod client;
pub mod server;

pub use client::{ClientAssociation, RequestOutcome};
pub use server::ServerAssociation;

/// Fixed per-fragment overhead budget subtracted from the PDU size
const PDATA_OVERHEAD: usize = 6;

/// Lifecycle states of an association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No session underway
    Unconnected,
    /// Negotiation in flight
    Negotiating,
    /// Negotiation succeeded; DIMSE exchange is possible
    Established,
    /// Orderly release in flight
    Releasing,
    /// Abort in flight
    Aborting,
    /// Irrecoverable failure; see the latched error message
    Error,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Unconnected => "unconnected",
            State::Negotiating => "negotiating",
            State::Established => "established",
            State::Releasing => "releasing",
            State::Aborting => "aborting",
            State::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// One proposed presentation context and its negotiated outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
    /// Context id; assigned an odd value when the request is built
    pub id: u8,
    /// Abstract syntax UID
    pub abstract_syntax: String,
    /// Candidate transfer syntaxes, in proposal order
    pub transfer_syntaxes: Vec<String>,
    accepted: Option<usize>,
}

impl PresentationContext {
    /// Create a context proposing `transfer_syntaxes` for `abstract_syntax`
    pub fn new(abstract_syntax: impl Into<String>, transfer_syntaxes: Vec<String>) -> Self {
        Self {
            id: 0,
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes,
            accepted: None,
        }
    }

    /// Whether the acceptor accepted this context
    pub fn accepted(&self) -> bool {
        self.accepted.is_some()
    }

    /// The transfer syntax the acceptor selected, if any
    pub fn accepted_transfer_syntax(&self) -> Option<&str> {
        self.accepted
            .and_then(|i| self.transfer_syntaxes.get(i))
            .map(String::as_str)
    }

    pub(crate) fn record_acceptance(&mut self, transfer_syntax: &str) -> bool {
        match self
            .transfer_syntaxes
            .iter()
            .position(|ts| ts == transfer_syntax)
        {
            Some(i) => {
                self.accepted = Some(i);
                true
            }
            None => false,
        }
    }
}

/// One accepted presentation context as used by the exchange layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedContext {
    /// Context id on the wire
    pub id: u8,
    /// Abstract syntax UID
    pub abstract_syntax: String,
    /// Negotiated transfer syntax UID
    pub transfer_syntax: String,
}

/// State shared by both association roles
pub(crate) struct AssociationCore {
    pub(crate) id: Uuid,
    pub(crate) role: Role,
    pub(crate) params: SessionParams,
    pub(crate) state: State,
    pub(crate) link: Option<Box<dyn UpperLayer>>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) accepted: Vec<AcceptedContext>,
    pub(crate) peer_max_pdu: u32,
    next_message_id: u16,
    error: Option<String>,
    pending: VecDeque<PDataValue>,
}

impl AssociationCore {
    pub(crate) fn new(role: Role, params: SessionParams, codec: Arc<dyn Codec>) -> Self {
        let max_pdu = params.max_pdu;
        Self {
            id: Uuid::new_v4(),
            role,
            params,
            state: State::Unconnected,
            link: None,
            codec,
            accepted: Vec::new(),
            peer_max_pdu: max_pdu,
            next_message_id: 1,
            error: None,
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn next_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    pub(crate) fn context_for(&self, abstract_syntax: &str) -> Option<AcceptedContext> {
        self.accepted
            .iter()
            .find(|c| c.abstract_syntax == abstract_syntax)
            .cloned()
    }

    pub(crate) fn context_by_id(&self, id: u8) -> Option<&AcceptedContext> {
        self.accepted.iter().find(|c| c.id == id)
    }

    /// Latched first error message, if any
    pub(crate) fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Latch the first error message; later ones are ignored until cleared
    pub(crate) fn latch_error(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(message.into());
        }
    }

    pub(crate) fn clear_error(&mut self) {
        self.error = None;
    }

    pub(crate) async fn send_pdu(&mut self, pdu: Pdu) -> Result<()> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| DimseError::InvalidState("no session attached".to_string()))?;
        debug!(association = %self.id, pdu = pdu.name(), "sending PDU");
        link.send(pdu).await
    }

    /// Receive one PDU. `Ok(None)` means the timeout elapsed.
    pub(crate) async fn recv_pdu(&mut self, timeout: Duration) -> Result<Option<Pdu>> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| DimseError::InvalidState("no session attached".to_string()))?;
        link.receive(timeout).await
    }

    /// Record a protocol failure: latch the reason, abort the session, and
    /// move to the error state.
    pub(crate) async fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(association = %self.id, "{}", message);
        self.latch_error(message);
        if let Some(mut link) = self.link.take() {
            let _ = link
                .send(Pdu::Abort {
                    source: AbortSource::ServiceUser,
                })
                .await;
            link.close().await;
        }
        self.state = State::Error;
    }

    /// Fire-and-forget abort; the object is bookkept as unconnected at once
    pub(crate) async fn do_abort(&mut self) {
        if self.state == State::Unconnected || self.state == State::Error {
            // No farewell owed, but a half-open session handle is released
            self.drop_link().await;
            return;
        }
        self.state = State::Aborting;
        if let Some(mut link) = self.link.take() {
            let _ = link
                .send(Pdu::Abort {
                    source: AbortSource::ServiceUser,
                })
                .await;
            link.close().await;
        }
        self.accepted.clear();
        self.state = State::Unconnected;
    }

    /// Drop the session without any farewell PDU
    pub(crate) async fn drop_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
    }

    fn require_established(&self) -> Result<()> {
        if self.state != State::Established {
            return Err(DimseError::InvalidState(format!(
                "association is {}, not established",
                self.state
            )));
        }
        Ok(())
    }

    fn fragment_budget(&self) -> usize {
        (self.peer_max_pdu as usize)
            .saturating_sub(PDATA_OVERHEAD)
            .max(64)
    }

    fn fragments(&self, context_id: u8, is_command: bool, data: Bytes) -> Vec<PDataValue> {
        let budget = self.fragment_budget();
        if data.is_empty() {
            return vec![PDataValue {
                context_id,
                is_command,
                is_last: true,
                data,
            }];
        }
        let mut out = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let take = rest.len().min(budget);
            let chunk = rest.split_to(take);
            out.push(PDataValue {
                context_id,
                is_command,
                is_last: rest.is_empty(),
                data: chunk,
            });
        }
        out
    }

    pub(crate) async fn send_command(
        &mut self,
        context_id: u8,
        mut command: CommandSet,
        record: Option<&Record>,
    ) -> Result<()> {
        self.require_established()?;
        let context = self.context_by_id(context_id).cloned().ok_or_else(|| {
            DimseError::protocol(format!("unknown presentation context {}", context_id))
        })?;

        command.has_dataset = record.is_some();
        debug!(
            association = %self.id,
            command = %command.field,
            message_id = command.message_id,
            context = context_id,
            "sending command"
        );

        let encoded = self.codec.encode_command(&command)?;
        let mut fragments = self.fragments(context_id, true, encoded);
        if let Some(record) = record {
            let encoded = self
                .codec
                .encode_record(record, &context.transfer_syntax)?;
            fragments.extend(self.fragments(context_id, false, encoded));
        }

        for value in fragments {
            if let Err(e) = self.send_pdu(Pdu::PData { values: vec![value] }).await {
                self.fail(format!("send failed: {}", e)).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Pull the next P-DATA value, surfacing interleaved control PDUs.
    async fn next_value(&mut self, deadline: Instant) -> Result<ValueOrControl> {
        loop {
            if let Some(value) = self.pending.pop_front() {
                return Ok(ValueOrControl::Value(value));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv_pdu(remaining).await {
                Ok(None) => return Ok(ValueOrControl::TimedOut),
                Ok(Some(Pdu::PData { values })) => {
                    self.pending.extend(values);
                }
                Ok(Some(Pdu::ReleaseRq)) => return Ok(ValueOrControl::ReleaseRequested),
                Ok(Some(Pdu::Abort { source })) => {
                    self.latch_error(format!("aborted by peer ({:?})", source));
                    self.drop_link().await;
                    self.accepted.clear();
                    self.state = State::Unconnected;
                    return Err(DimseError::PeerAborted);
                }
                Ok(Some(other)) => {
                    let msg = format!("unexpected {} during data transfer", other.name());
                    self.fail(msg.clone()).await;
                    return Err(DimseError::protocol(msg));
                }
                Err(e) => {
                    self.fail(format!("receive failed: {}", e)).await;
                    return Err(e);
                }
            }
        }
    }

    pub(crate) async fn receive_command(
        &mut self,
        expected: Expected,
        timeout: Duration,
        flags: ReceiveFlags,
    ) -> Result<Received> {
        self.require_established()?;
        let deadline = Instant::now() + timeout;
        let mut buffer = BytesMut::new();
        let mut context_id: Option<u8> = None;

        loop {
            match self.next_value(deadline).await? {
                ValueOrControl::TimedOut => {
                    if !buffer.is_empty() {
                        let msg = "timed out mid-command".to_string();
                        self.fail(msg.clone()).await;
                        return Err(DimseError::protocol(msg));
                    }
                    if flags.allow_timeout {
                        return Ok(Received::TimedOut);
                    }
                    return Err(DimseError::timeout(format!(
                        "no command within {:?}",
                        timeout
                    )));
                }
                ValueOrControl::ReleaseRequested => {
                    if flags.allow_release {
                        self.state = State::Releasing;
                        return Ok(Received::ReleaseRequested);
                    }
                    let msg = "unexpected release request".to_string();
                    self.fail(msg.clone()).await;
                    return Err(DimseError::protocol(msg));
                }
                ValueOrControl::Value(value) => {
                    if !value.is_command {
                        let msg = "dataset fragment while awaiting a command".to_string();
                        self.fail(msg.clone()).await;
                        return Err(DimseError::protocol(msg));
                    }
                    if let Some(id) = context_id {
                        if id != value.context_id {
                            let msg = "command fragments span presentation contexts".to_string();
                            self.fail(msg.clone()).await;
                            return Err(DimseError::protocol(msg));
                        }
                    } else {
                        context_id = Some(value.context_id);
                    }
                    buffer.extend_from_slice(&value.data);
                    if !value.is_last {
                        continue;
                    }

                    let command = match self.codec.decode_command(&buffer) {
                        Ok(command) => command,
                        Err(e) => {
                            let msg = format!("malformed command: {}", e);
                            self.fail(msg.clone()).await;
                            return Err(DimseError::protocol(msg));
                        }
                    };
                    let context_id = context_id.unwrap_or_default();

                    if let Expected::Only(field) = expected {
                        if command.field != field {
                            let msg = format!(
                                "expected {}, received {}",
                                field, command.field
                            );
                            self.fail(msg.clone()).await;
                            return Err(DimseError::protocol(msg));
                        }
                    }

                    debug!(
                        association = %self.id,
                        command = %command.field,
                        message_id = command.message_id,
                        context = context_id,
                        "received command"
                    );
                    return Ok(Received::Command {
                        context_id,
                        command,
                    });
                }
            }
        }
    }

    pub(crate) async fn receive_record(&mut self, context_id: u8) -> Result<Record> {
        self.require_established()?;
        let transfer_syntax = self
            .context_by_id(context_id)
            .map(|c| c.transfer_syntax.clone())
            .ok_or_else(|| {
                DimseError::protocol(format!("unknown presentation context {}", context_id))
            })?;

        let deadline = Instant::now() + self.params.read_timeout;
        let mut buffer = BytesMut::new();

        loop {
            match self.next_value(deadline).await? {
                ValueOrControl::TimedOut => {
                    return Err(DimseError::timeout("no dataset within the read timeout"));
                }
                ValueOrControl::ReleaseRequested => {
                    let msg = "release request while awaiting a dataset".to_string();
                    self.fail(msg.clone()).await;
                    return Err(DimseError::protocol(msg));
                }
                ValueOrControl::Value(value) => {
                    if value.is_command {
                        let msg = "command fragment while awaiting a dataset".to_string();
                        self.fail(msg.clone()).await;
                        return Err(DimseError::protocol(msg));
                    }
                    if value.context_id != context_id {
                        let msg = format!(
                            "dataset arrived on context {}, expected {}",
                            value.context_id, context_id
                        );
                        self.fail(msg.clone()).await;
                        return Err(DimseError::protocol(msg));
                    }
                    buffer.extend_from_slice(&value.data);
                    if !value.is_last {
                        continue;
                    }
                    return match self.codec.decode_record(&buffer, &transfer_syntax) {
                        Ok(record) => Ok(record),
                        Err(e) => {
                            let msg = format!("malformed dataset: {}", e);
                            self.fail(msg.clone()).await;
                            Err(DimseError::protocol(msg))
                        }
                    };
                }
            }
        }
    }
}

enum ValueOrControl {
    Value(PDataValue),
    ReleaseRequested,
    TimedOut,
}
