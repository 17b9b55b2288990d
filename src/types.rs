//! Common types for association negotiation and DIMSE exchange

use serde::{Deserialize, Serialize};

/// DIMSE command field values as carried in the command set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandField {
    /// C-STORE-RQ
    CStoreRq,
    /// C-STORE-RSP
    CStoreRsp,
    /// C-FIND-RQ
    CFindRq,
    /// C-FIND-RSP
    CFindRsp,
    /// C-MOVE-RQ
    CMoveRq,
    /// C-MOVE-RSP
    CMoveRsp,
    /// C-ECHO-RQ
    CEchoRq,
    /// C-ECHO-RSP
    CEchoRsp,
    /// N-SET-RQ
    NSetRq,
    /// N-SET-RSP
    NSetRsp,
    /// N-CREATE-RQ
    NCreateRq,
    /// N-CREATE-RSP
    NCreateRsp,
    /// C-CANCEL-RQ
    CCancelRq,
}

impl CommandField {
    /// The wire value of the command field
    pub fn code(self) -> u16 {
        match self {
            CommandField::CStoreRq => 0x0001,
            CommandField::CStoreRsp => 0x8001,
            CommandField::CFindRq => 0x0020,
            CommandField::CFindRsp => 0x8020,
            CommandField::CMoveRq => 0x0021,
            CommandField::CMoveRsp => 0x8021,
            CommandField::CEchoRq => 0x0030,
            CommandField::CEchoRsp => 0x8030,
            CommandField::NSetRq => 0x0120,
            CommandField::NSetRsp => 0x8120,
            CommandField::NCreateRq => 0x0140,
            CommandField::NCreateRsp => 0x8140,
            CommandField::CCancelRq => 0x0FFF,
        }
    }

    /// Whether this field denotes a request
    pub fn is_request(self) -> bool {
        matches!(
            self,
            CommandField::CStoreRq
                | CommandField::CFindRq
                | CommandField::CMoveRq
                | CommandField::CEchoRq
                | CommandField::NSetRq
                | CommandField::NCreateRq
                | CommandField::CCancelRq
        )
    }

    /// The response field answering this request, if any
    pub fn response(self) -> Option<CommandField> {
        match self {
            CommandField::CStoreRq => Some(CommandField::CStoreRsp),
            CommandField::CFindRq => Some(CommandField::CFindRsp),
            CommandField::CMoveRq => Some(CommandField::CMoveRsp),
            CommandField::CEchoRq => Some(CommandField::CEchoRsp),
            CommandField::NSetRq => Some(CommandField::NSetRsp),
            CommandField::NCreateRq => Some(CommandField::NCreateRsp),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommandField::CStoreRq => "C-STORE-RQ",
            CommandField::CStoreRsp => "C-STORE-RSP",
            CommandField::CFindRq => "C-FIND-RQ",
            CommandField::CFindRsp => "C-FIND-RSP",
            CommandField::CMoveRq => "C-MOVE-RQ",
            CommandField::CMoveRsp => "C-MOVE-RSP",
            CommandField::CEchoRq => "C-ECHO-RQ",
            CommandField::CEchoRsp => "C-ECHO-RSP",
            CommandField::NSetRq => "N-SET-RQ",
            CommandField::NSetRsp => "N-SET-RSP",
            CommandField::NCreateRq => "N-CREATE-RQ",
            CommandField::NCreateRsp => "N-CREATE-RSP",
            CommandField::CCancelRq => "C-CANCEL-RQ",
        };
        write!(f, "{}", name)
    }
}

/// A DIMSE status code as carried in a response command set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status(pub u16);

/// Shared classification of the DIMSE status space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Operation completed
    Success,
    /// More responses follow
    Pending,
    /// Operation cancelled by the peer
    Cancelled,
    /// Completed with a warning
    Warning,
    /// Refused by the peer
    Refused,
    /// Failed
    Failed,
}

impl Status {
    /// Success
    pub const SUCCESS: Status = Status(0x0000);
    /// Pending
    pub const PENDING: Status = Status(0xFF00);
    /// Pending with optional keys not supported
    pub const PENDING_WARNING: Status = Status(0xFF01);
    /// Cancelled
    pub const CANCELLED: Status = Status(0xFE00);
    /// Refused: SOP class not supported
    pub const SOP_CLASS_NOT_SUPPORTED: Status = Status(0x0122);
    /// Refused: not authorized
    pub const NOT_AUTHORIZED: Status = Status(0x0124);
    /// Failure: unable to process
    pub const UNABLE_TO_PROCESS: Status = Status(0xC000);
    /// Failure: processing failure
    pub const PROCESSING_FAILURE: Status = Status(0x0110);

    /// Classify this status into the shared taxonomy.
    ///
    /// Verb-specific sub-ranges refine this in the verb layer; the rules here
    /// cover the classification every verb shares: 0x0000 success,
    /// 0xFF00/0xFF01 pending, 0xFE00 cancelled, 0xBxxx warning, 0xA7xx and
    /// the refusal codes of the N-service table refused, 0xCxxx and the rest
    /// failed.
    pub fn class(self) -> StatusClass {
        match self.0 {
            0x0000 => StatusClass::Success,
            0xFF00 | 0xFF01 => StatusClass::Pending,
            0xFE00 => StatusClass::Cancelled,
            0x0107 | 0x0116 => StatusClass::Warning,
            0xB000..=0xBFFF => StatusClass::Warning,
            0xA700..=0xA7FF => StatusClass::Refused,
            0x0122 | 0x0124 | 0x0213 => StatusClass::Refused,
            0xC000..=0xCFFF => StatusClass::Failed,
            _ => StatusClass::Failed,
        }
    }

    /// Whether more responses follow this one
    pub fn is_pending(self) -> bool {
        self.class() == StatusClass::Pending
    }

    /// Whether this status terminates a response sequence
    pub fn is_final(self) -> bool {
        !self.is_pending()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}

/// Priority levels for C-STORE and C-MOVE requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    /// Low priority
    Low,
    /// Medium priority (default)
    Medium,
    /// High priority
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    /// The wire value of the priority field
    pub fn code(self) -> u16 {
        match self {
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
            Priority::Low => 0x0002,
        }
    }
}

/// DICOM query/retrieve levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryLevel {
    /// Patient level
    Patient,
    /// Study level
    Study,
    /// Series level
    Series,
    /// Image level
    Image,
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryLevel::Patient => write!(f, "PATIENT"),
            QueryLevel::Study => write!(f, "STUDY"),
            QueryLevel::Series => write!(f, "SERIES"),
            QueryLevel::Image => write!(f, "IMAGE"),
        }
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = crate::error::DimseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" => Ok(QueryLevel::Image),
            _ => Err(crate::error::DimseError::config(format!(
                "Invalid query level: {}",
                s
            ))),
        }
    }
}

/// A typed DIMSE command set.
///
/// The Transport Codec turns this into bytes and back; the exchange layer
/// only ever sees the typed form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSet {
    /// Command field
    pub field: CommandField,

    /// Message ID (requests)
    pub message_id: u16,

    /// Message ID being responded to (responses)
    pub responded_to: Option<u16>,

    /// Affected/requested SOP class UID
    pub sop_class_uid: Option<String>,

    /// Affected/requested SOP instance UID
    pub sop_instance_uid: Option<String>,

    /// Priority (C-STORE, C-FIND, C-MOVE requests)
    pub priority: Option<Priority>,

    /// Status (responses)
    pub status: Option<Status>,

    /// Whether a data set follows this command
    pub has_dataset: bool,

    /// Move destination AE title (C-MOVE-RQ)
    pub move_destination: Option<String>,

    /// Remaining sub-operations (C-MOVE-RSP)
    pub remaining: Option<u16>,

    /// Completed sub-operations (C-MOVE-RSP)
    pub completed: Option<u16>,

    /// Failed sub-operations (C-MOVE-RSP)
    pub failed: Option<u16>,

    /// Warning sub-operations (C-MOVE-RSP)
    pub warned: Option<u16>,
}

impl CommandSet {
    /// Create a request command set
    pub fn request(field: CommandField, message_id: u16) -> Self {
        Self {
            field,
            message_id,
            responded_to: None,
            sop_class_uid: None,
            sop_instance_uid: None,
            priority: None,
            status: None,
            has_dataset: false,
            move_destination: None,
            remaining: None,
            completed: None,
            failed: None,
            warned: None,
        }
    }

    /// Create a response command set answering `request`
    pub fn response(request: &CommandSet, status: Status) -> Self {
        let field = request
            .field
            .response()
            .unwrap_or(request.field);
        Self {
            field,
            message_id: request.message_id,
            responded_to: Some(request.message_id),
            sop_class_uid: request.sop_class_uid.clone(),
            sop_instance_uid: None,
            priority: None,
            status: Some(status),
            has_dataset: false,
            move_destination: None,
            remaining: None,
            completed: None,
            failed: None,
            warned: None,
        }
    }

    /// Set the affected SOP class UID
    pub fn with_sop_class(mut self, uid: impl Into<String>) -> Self {
        self.sop_class_uid = Some(uid.into());
        self
    }

    /// Set the affected SOP instance UID
    pub fn with_sop_instance(mut self, uid: impl Into<String>) -> Self {
        self.sop_instance_uid = Some(uid.into());
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Mark that a data set follows this command
    pub fn with_dataset(mut self) -> Self {
        self.has_dataset = true;
        self
    }

    /// Set the move destination
    pub fn with_move_destination(mut self, aet: impl Into<String>) -> Self {
        self.move_destination = Some(aet.into());
        self
    }

    /// Set the sub-operation counters
    pub fn with_sub_operations(
        mut self,
        remaining: u16,
        completed: u16,
        failed: u16,
        warned: u16,
    ) -> Self {
        self.remaining = Some(remaining);
        self.completed = Some(completed);
        self.failed = Some(failed);
        self.warned = Some(warned);
        self
    }

    /// The status of this command set, defaulting to success for requests
    pub fn status(&self) -> Status {
        self.status.unwrap_or(Status::SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_field_codes() {
        assert_eq!(CommandField::CEchoRq.code(), 0x0030);
        assert_eq!(CommandField::CEchoRsp.code(), 0x8030);
        assert_eq!(CommandField::CFindRq.response(), Some(CommandField::CFindRsp));
        assert!(CommandField::CCancelRq.is_request());
        assert!(CommandField::CCancelRq.response().is_none());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(Status::SUCCESS.class(), StatusClass::Success);
        assert_eq!(Status(0xFF00).class(), StatusClass::Pending);
        assert_eq!(Status(0xFF01).class(), StatusClass::Pending);
        assert_eq!(Status(0xFE00).class(), StatusClass::Cancelled);
        assert_eq!(Status(0xB000).class(), StatusClass::Warning);
        assert_eq!(Status(0xA700).class(), StatusClass::Refused);
        assert_eq!(Status(0xC210).class(), StatusClass::Failed);
        assert_eq!(Status(0xA900).class(), StatusClass::Failed);
        assert!(Status(0xFF00).is_pending());
        assert!(Status::SUCCESS.is_final());
    }

    #[test]
    fn test_query_level_parsing() {
        assert_eq!("PATIENT".parse::<QueryLevel>().unwrap(), QueryLevel::Patient);
        assert_eq!("study".parse::<QueryLevel>().unwrap(), QueryLevel::Study);
        assert!("INVALID".parse::<QueryLevel>().is_err());
    }

    #[test]
    fn test_response_builder() {
        let rq = CommandSet::request(CommandField::CEchoRq, 7)
            .with_sop_class("1.2.840.10008.1.1");
        let rsp = CommandSet::response(&rq, Status::SUCCESS);
        assert_eq!(rsp.field, CommandField::CEchoRsp);
        assert_eq!(rsp.responded_to, Some(7));
        assert_eq!(rsp.sop_class_uid.as_deref(), Some("1.2.840.10008.1.1"));
        assert_eq!(rsp.status(), Status::SUCCESS);
    }
}
