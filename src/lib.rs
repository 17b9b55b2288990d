//! DICOM upper-layer association and DIMSE message exchange
//!
//! This crate provides both Service Class Provider (SCP) and Service Class
//! User (SCU) sides of DICOM networking: the association state machine with
//! presentation-context negotiation, the DIMSE exchange layer carrying typed
//! command/record pairs, the verb library built on it (C-ECHO, C-FIND,
//! C-MOVE, C-STORE, N-CREATE, N-SET), and the query-matching engine driving
//! C-FIND responses.
//!
//! # Features
//! - Initiator and acceptor association state machines
//! - Background association listener with queue hand-off
//! - Pluggable transport and dataset codec collaborators
//! - Attribute matching (exact, wildcard, list, range, sequence)

pub mod association;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod listener;
pub mod matching;
pub mod record;
pub mod scp;
pub mod scu;
pub mod transport;
pub mod types;
pub mod verbs;

// Re-export commonly used types
pub use association::{ClientAssociation, PresentationContext, ServerAssociation, State};
pub use channel::{DimseChannel, Expected, Received, ReceiveFlags};
pub use codec::{Codec, JsonCodec};
pub use config::{DimseConfig, RemoteNode, Role, SessionParams};
pub use error::{DimseError, Result};
pub use listener::{AssociationListener, ListenerEvent};
pub use matching::match_record;
pub use record::{Element, Record, Value};
pub use scp::{DataSource, DimseScp, InMemoryDataSource};
pub use scu::{DimseScu, ScuBuilder};
pub use types::{CommandField, CommandSet, Priority, QueryLevel, Status, StatusClass};

/// Default DICOM port
pub const DEFAULT_DIMSE_PORT: u16 = 11112;

/// Default maximum PDU size in bytes
pub const DEFAULT_MAX_PDU: u32 = 16384;

/// Hard cap on proposed presentation contexts per association
pub const MAX_PROPOSED_CONTEXTS: usize = 128;

/// Well-known UIDs used during negotiation and by the verb library
pub mod uids {
    /// The application context every association must name
    pub const APPLICATION_CONTEXT: &str = "1.2.840.10008.3.1.1.1";

    /// Verification SOP class (C-ECHO)
    pub const VERIFICATION: &str = "1.2.840.10008.1.1";

    /// Patient Root Query/Retrieve - FIND
    pub const PATIENT_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";

    /// Patient Root Query/Retrieve - MOVE
    pub const PATIENT_ROOT_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.1.2";

    /// Study Root Query/Retrieve - FIND
    pub const STUDY_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";

    /// Study Root Query/Retrieve - MOVE
    pub const STUDY_ROOT_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";

    /// Implicit VR Little Endian transfer syntax
    pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

    /// Explicit VR Little Endian transfer syntax
    pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    /// Explicit VR Big Endian transfer syntax
    pub const EXPLICIT_VR_BE: &str = "1.2.840.10008.1.2.2";
}
