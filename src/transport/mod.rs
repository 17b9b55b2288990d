//! Typed upper-layer transport collaborators.
//!
//! This crate never touches raw bytes on the wire. A transport implementation
//! moves typed [`Pdu`] values between two nodes; PDU byte encoding lives with
//! the implementation, next to the [`crate::codec::Codec`] that encodes the
//! command sets and datasets carried inside P-DATA fragments. The in-process
//! [`loopback`] transport ships with the crate.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub mod loopback;

/// One fragment of a P-DATA transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PDataValue {
    /// Presentation context the fragment belongs to
    pub context_id: u8,
    /// Whether this fragment carries command-set bytes (else dataset bytes)
    pub is_command: bool,
    /// Whether this is the last fragment of the value
    pub is_last: bool,
    /// Fragment payload
    pub data: Bytes,
}

/// One proposed presentation context inside an associate request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedContext {
    /// Odd context id assigned by the proposer
    pub id: u8,
    /// Abstract syntax UID being proposed
    pub abstract_syntax: String,
    /// Candidate transfer syntax UIDs, in proposal order
    pub transfer_syntaxes: Vec<String>,
}

/// Why an individual presentation context was turned down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRejection {
    /// Rejected by the acceptor without a specific reason
    NoReason,
    /// The abstract syntax is not supported
    AbstractSyntaxNotSupported,
    /// None of the proposed transfer syntaxes is supported
    TransferSyntaxesNotSupported,
}

/// Per-context outcome inside an associate acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextResult {
    /// Context accepted with the chosen transfer syntax
    Accepted {
        /// Context id from the proposal
        id: u8,
        /// The transfer syntax the acceptor selected
        transfer_syntax: String,
    },
    /// Context rejected
    Rejected {
        /// Context id from the proposal
        id: u8,
        /// Rejection reason
        reason: ContextRejection,
    },
}

impl ContextResult {
    /// The context id this result refers to
    pub fn id(&self) -> u8 {
        match self {
            ContextResult::Accepted { id, .. } | ContextResult::Rejected { id, .. } => *id,
        }
    }
}

/// An associate request proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateRq {
    /// Calling AE title
    pub calling_ae: String,
    /// Called AE title
    pub called_ae: String,
    /// Application context name; must match the well-known identifier
    pub application_context: String,
    /// Maximum PDU length the proposer will receive
    pub max_pdu: u32,
    /// Proposed presentation contexts
    pub contexts: Vec<ProposedContext>,
}

/// An associate acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateAc {
    /// Application context name echoed back
    pub application_context: String,
    /// Maximum PDU length the acceptor will receive
    pub max_pdu: u32,
    /// Per-context outcomes, one per proposed context
    pub results: Vec<ContextResult>,
}

/// Whether an association rejection is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// The proposal will never be accepted
    Permanent,
    /// The acceptor may accept the same proposal later
    Transient,
}

/// Which side tore the association down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortSource {
    /// The service user requested the abort
    ServiceUser,
    /// The service provider (transport layer) aborted
    ServiceProvider,
}

/// The upper-layer protocol data units exchanged over a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    /// A-ASSOCIATE-RQ
    AssociateRq(AssociateRq),
    /// A-ASSOCIATE-AC
    AssociateAc(AssociateAc),
    /// A-ASSOCIATE-RJ
    AssociateRj {
        /// Rejection permanence
        kind: RejectKind,
        /// Human-readable diagnostic
        reason: String,
    },
    /// P-DATA-TF carrying command/dataset fragments
    PData {
        /// Fragments in transmission order
        values: Vec<PDataValue>,
    },
    /// A-RELEASE-RQ
    ReleaseRq,
    /// A-RELEASE-RP
    ReleaseRp,
    /// A-ABORT
    Abort {
        /// Which side aborted
        source: AbortSource,
    },
}

impl Pdu {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Pdu::AssociateRq(_) => "A-ASSOCIATE-RQ",
            Pdu::AssociateAc(_) => "A-ASSOCIATE-AC",
            Pdu::AssociateRj { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRq => "A-RELEASE-RQ",
            Pdu::ReleaseRp => "A-RELEASE-RP",
            Pdu::Abort { .. } => "A-ABORT",
        }
    }
}

/// One established byte-stream session, seen as typed PDUs
#[async_trait]
pub trait UpperLayer: Send {
    /// Send one PDU to the peer
    async fn send(&mut self, pdu: Pdu) -> Result<()>;

    /// Wait up to `timeout` for the next PDU.
    ///
    /// Returns `Ok(None)` when nothing arrived in time; a closed or failed
    /// session is an error.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Pdu>>;

    /// Close the underlying session
    async fn close(&mut self);

    /// Label of the peer endpoint, for logging
    fn peer(&self) -> &str;
}

/// Dials new sessions on behalf of an initiator
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session to `host:port`, waiting at most `timeout`
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn UpperLayer>>;
}

/// Accepts incoming sessions on behalf of an acceptor
#[async_trait]
pub trait SessionAcceptor: Send {
    /// Wait up to `timeout` for an incoming session.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn accept(&mut self, timeout: Duration) -> Result<Option<Box<dyn UpperLayer>>>;
}
