//! Error types for association and DIMSE operations

use thiserror::Error;

use crate::types::Status;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur during association handling and DIMSE exchange
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Association rejected: {0}")]
    AssociationRejected(String),

    #[error("No common presentation context")]
    NoCommonContext,

    #[error("No accepted presentation context for {0}")]
    NoAcceptedContext(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Association aborted by peer")]
    PeerAborted,

    #[error("Invalid association state: {0}")]
    InvalidState(String),

    #[error("DIMSE operation failed: {0}")]
    OperationFailed(String),

    #[error("Operation refused by peer (status {status}): {message}")]
    Refused { status: Status, message: String },

    #[error("Invalid AE Title: {0}")]
    InvalidAeTitle(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new operation failed error
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }

    /// Create a new refused error carrying the peer status code
    pub fn refused(status: Status, msg: impl Into<String>) -> Self {
        Self::Refused {
            status,
            message: msg.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a new listener error
    pub fn listener(msg: impl Into<String>) -> Self {
        Self::Listener(msg.into())
    }

    /// Check if this error is recoverable by retrying the operation
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DimseError::Network(_) | DimseError::Timeout(_) | DimseError::AssociationRejected(_)
        )
    }

    /// Check if this error must abort the owning association.
    ///
    /// Timeouts and peer aborts never do: a timeout is surfaced so the caller
    /// can retry, and a peer abort already terminated the association.
    pub fn aborts_association(&self) -> bool {
        !matches!(self, DimseError::Timeout(_) | DimseError::PeerAborted)
    }
}
