//! Configuration types for association endpoints

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::uids;
use crate::{DEFAULT_DIMSE_PORT, DEFAULT_MAX_PDU};

/// Which side of an association an endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Requests associations (SCU side)
    Initiator,
    /// Accepts associations (SCP side)
    Acceptor,
}

/// Configuration for a DIMSE endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Local Application Entity Title
    pub local_aet: String,

    /// Host the acceptor transport binds to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Port the acceptor transport listens on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Read timeout for blocking receives, in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Listener polling interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Abstract syntaxes the acceptor is willing to negotiate
    #[serde(default = "default_abstract_syntaxes")]
    pub allowed_abstract_syntaxes: Vec<String>,

    /// Transfer syntaxes the acceptor allows, in order of preference
    #[serde(default = "default_transfer_syntaxes")]
    pub allowed_transfer_syntaxes: Vec<String>,

    /// Maximum number of concurrent associations
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Enable the verification service (C-ECHO)
    #[serde(default = "default_true")]
    pub enable_echo: bool,

    /// Enable the query service (C-FIND)
    #[serde(default = "default_true")]
    pub enable_find: bool,

    /// Enable the retrieve service (C-MOVE)
    #[serde(default = "default_true")]
    pub enable_move: bool,

    /// Enable the storage service (C-STORE)
    #[serde(default = "default_true")]
    pub enable_store: bool,

    /// Enable the object lifecycle services (N-CREATE/N-SET)
    #[serde(default = "default_true")]
    pub enable_object: bool,
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Connection timeout in milliseconds (overrides the endpoint setting)
    pub connect_timeout_ms: Option<u64>,

    /// Read timeout in milliseconds (overrides the endpoint setting)
    pub read_timeout_ms: Option<u64>,

    /// Maximum PDU size for this node (overrides the endpoint setting)
    pub max_pdu: Option<u32>,
}

/// Immutable per-association session parameters.
///
/// Built once from the endpoint configuration (and, for the initiator, the
/// target node) before any network activity; an association never mutates
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// AE title of the local node
    pub calling_ae: String,
    /// AE title of the peer node
    pub called_ae: String,
    /// Peer host (initiator) or bind host (acceptor)
    pub host: String,
    /// Peer port (initiator) or listen port (acceptor)
    pub port: u16,
    /// Timeout applied to blocking receives
    pub read_timeout: Duration,
    /// Maximum PDU size for this session
    pub max_pdu: u32,
    /// Which side this endpoint plays
    pub role: Role,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: "DIMSE_NET".to_string(),
            bind_host: default_bind_host(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            poll_interval_ms: default_poll_interval(),
            allowed_abstract_syntaxes: default_abstract_syntaxes(),
            allowed_transfer_syntaxes: default_transfer_syntaxes(),
            max_associations: default_max_associations(),
            enable_echo: true,
            enable_find: true,
            enable_move: true,
            enable_store: true,
            enable_object: true,
        }
    }
}

impl DimseConfig {
    /// Load a configuration from a TOML string
    pub fn from_toml_str(toml: &str) -> crate::error::Result<Self> {
        let config: Self = toml::from_str(toml)
            .map_err(|e| crate::error::DimseError::config(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_toml_path(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Get the connection timeout as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get the read timeout as a Duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Get the listener polling interval as a Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title("local", &self.local_aet)?;

        if self.port == 0 {
            return Err(crate::error::DimseError::config(
                "Port must be greater than 0",
            ));
        }

        if self.max_pdu < 4096 || self.max_pdu > 131_072 {
            return Err(crate::error::DimseError::config(
                "Max PDU size must be between 4096 and 131072 bytes",
            ));
        }

        if self.allowed_transfer_syntaxes.is_empty() {
            return Err(crate::error::DimseError::config(
                "At least one transfer syntax must be allowed",
            ));
        }

        Ok(())
    }

    /// Session parameters for the acceptor side of an association.
    ///
    /// The peer identity is unknown until a proposal arrives; it is recorded
    /// on the association once received.
    pub fn acceptor_params(&self) -> crate::error::Result<SessionParams> {
        self.validate()?;
        Ok(SessionParams {
            calling_ae: self.local_aet.clone(),
            called_ae: String::new(),
            host: self.bind_host.clone(),
            port: self.port,
            read_timeout: self.read_timeout(),
            max_pdu: self.max_pdu,
            role: Role::Acceptor,
        })
    }

    /// Session parameters for dialing `node`
    pub fn initiator_params(&self, node: &RemoteNode) -> crate::error::Result<SessionParams> {
        validate_ae_title("local", &self.local_aet)?;
        node.validate()?;
        Ok(SessionParams {
            calling_ae: self.local_aet.clone(),
            called_ae: node.ae_title.clone(),
            host: node.host.clone(),
            port: node.port,
            read_timeout: node
                .read_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.read_timeout()),
            max_pdu: node.max_pdu.unwrap_or(self.max_pdu),
            role: Role::Initiator,
        })
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            connect_timeout_ms: None,
            read_timeout_ms: None,
            max_pdu: None,
        }
    }

    /// Set the connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the read timeout for this node
    pub fn with_read_timeout(mut self, timeout_ms: u64) -> Self {
        self.read_timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the maximum PDU size for this node
    pub fn with_max_pdu(mut self, size: u32) -> Self {
        self.max_pdu = Some(size);
        self
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title("remote", &self.ae_title)?;

        if self.host.is_empty() {
            return Err(crate::error::DimseError::config(
                "Remote host cannot be empty",
            ));
        }

        if self.port == 0 {
            return Err(crate::error::DimseError::config(
                "Remote port must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl SessionParams {
    /// Record the peer identity once a proposal names it
    pub fn with_peer(mut self, peer_ae: impl Into<String>) -> Self {
        self.called_ae = peer_ae.into();
        self
    }
}

fn validate_ae_title(which: &str, aet: &str) -> crate::error::Result<()> {
    if aet.is_empty() || aet.len() > 16 {
        return Err(crate::error::DimseError::InvalidAeTitle(format!(
            "{} AE title must be 1-16 characters",
            which
        )));
    }
    Ok(())
}

// Default value functions
fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_max_pdu() -> u32 {
    DEFAULT_MAX_PDU
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_read_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_poll_interval() -> u64 {
    10
}

fn default_abstract_syntaxes() -> Vec<String> {
    vec![
        uids::VERIFICATION.to_string(),
        uids::STUDY_ROOT_QR_FIND.to_string(),
        uids::STUDY_ROOT_QR_MOVE.to_string(),
    ]
}

fn default_transfer_syntaxes() -> Vec<String> {
    vec![
        uids::IMPLICIT_VR_LE.to_string(),
        uids::EXPLICIT_VR_LE.to_string(),
        uids::EXPLICIT_VR_BE.to_string(),
    ]
}

fn default_max_associations() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DimseConfig::default();
        assert_eq!(config.local_aet, "DIMSE_NET");
        assert_eq!(config.port, DEFAULT_DIMSE_PORT);
        assert_eq!(config.max_pdu, DEFAULT_MAX_PDU);
        assert!(config.enable_echo);
        assert!(config.enable_find);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = DimseConfig::default();

        config.local_aet = String::new();
        assert!(config.validate().is_err());

        config.local_aet = "A".repeat(17);
        assert!(config.validate().is_err());

        config.local_aet = "SCP".to_string();
        config.max_pdu = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_node_builder() {
        let node = RemoteNode::new("TEST_AET", "localhost", 11112)
            .with_timeout(10_000)
            .with_max_pdu(32_768);

        assert_eq!(node.ae_title, "TEST_AET");
        assert_eq!(node.host, "localhost");
        assert_eq!(node.port, 11112);
        assert_eq!(node.connect_timeout_ms, Some(10_000));
        assert_eq!(node.max_pdu, Some(32_768));
        assert!(node.validate().is_ok());
    }

    #[test]
    fn test_initiator_params_overrides() {
        let config = DimseConfig {
            local_aet: "LOCAL".to_string(),
            read_timeout_ms: 5_000,
            ..Default::default()
        };
        let node = RemoteNode::new("REMOTE", "peer.example", 104).with_read_timeout(2_000);
        let params = config.initiator_params(&node).unwrap();
        assert_eq!(params.calling_ae, "LOCAL");
        assert_eq!(params.called_ae, "REMOTE");
        assert_eq!(params.read_timeout, Duration::from_millis(2_000));
        assert_eq!(params.role, Role::Initiator);
    }

    #[test]
    fn test_invalid_remote_rejected_before_io() {
        let config = DimseConfig::default();
        let node = RemoteNode::new("", "peer.example", 104);
        assert!(config.initiator_params(&node).is_err());

        let node = RemoteNode::new("REMOTE", "peer.example", 0);
        assert!(config.initiator_params(&node).is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = DimseConfig::from_toml_str(
            r#"
            local_aet = "TOML_SCP"
            port = 11113
            max_pdu = 16384
            "#,
        )
        .unwrap();
        assert_eq!(config.local_aet, "TOML_SCP");
        assert_eq!(config.port, 11113);
        assert!(config.enable_move);
    }
}
