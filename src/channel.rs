//! DIMSE message exchange over an established association.
//!
//! The verb library composes over this capability trait instead of
//! inheriting from a shared request/response base; both
//! [`crate::association::ClientAssociation`] and
//! [`crate::association::ServerAssociation`] implement it.

use std::time::Duration;

use async_trait::async_trait;

use crate::association::AcceptedContext;
use crate::error::Result;
use crate::record::Record;
use crate::types::{CommandField, CommandSet};

/// What a call to `receive_command` is willing to accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// Any command field
    Any,
    /// Exactly this command field; anything else is a protocol failure
    Only(CommandField),
}

/// Outcomes a caller opted into for `receive_command`.
///
/// Without the matching flag, a peer release request or a timeout is
/// reported as an error instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveFlags {
    /// Report a peer-initiated release instead of failing on it
    pub allow_release: bool,
    /// Report a timed-out receive instead of failing on it
    pub allow_timeout: bool,
}

impl ReceiveFlags {
    /// Accept both peer release and timeout as ordinary outcomes
    pub fn lenient() -> Self {
        Self {
            allow_release: true,
            allow_timeout: true,
        }
    }
}

/// Result of a `receive_command` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A command arrived
    Command {
        /// Presentation context the command arrived on
        context_id: u8,
        /// The decoded command set
        command: CommandSet,
    },
    /// The peer requested release; confirm with
    /// [`crate::association::ServerAssociation::confirm_release`]
    ReleaseRequested,
    /// Nothing arrived within the timeout
    TimedOut,
}

/// Message exchange capabilities of an established association
#[async_trait]
pub trait DimseChannel: Send {
    /// Allocate the next message ID; strictly increasing per association
    fn next_message_id(&mut self) -> u16;

    /// Accepted presentation context for `abstract_syntax`, if negotiated
    fn context_for(&self, abstract_syntax: &str) -> Option<AcceptedContext>;

    /// Read timeout configured for this association
    fn read_timeout(&self) -> Duration;

    /// Send a command, optionally followed by a dataset record, on the given
    /// presentation context
    async fn send_command(
        &mut self,
        context_id: u8,
        command: CommandSet,
        record: Option<&Record>,
    ) -> Result<()>;

    /// Receive the next command.
    ///
    /// A received command whose field differs from `expected` is a protocol
    /// failure and aborts the association. A peer release request or a
    /// timeout is surfaced as [`Received::ReleaseRequested`] /
    /// [`Received::TimedOut`] when the corresponding flag is set, and as an
    /// error otherwise; a timeout never aborts the association.
    async fn receive_command(
        &mut self,
        expected: Expected,
        timeout: Duration,
        flags: ReceiveFlags,
    ) -> Result<Received>;

    /// Receive the dataset record announced by a preceding command on the
    /// given presentation context
    async fn receive_record(&mut self, context_id: u8) -> Result<Record>;

    /// Abort the association; no-op when already unconnected
    async fn abort(&mut self);
}
