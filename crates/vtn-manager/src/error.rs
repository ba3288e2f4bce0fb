//! Error types for VTN configuration operations.
//!
//! Configuration and conflict errors are returned synchronously to the
//! administrative caller. Packet-processing outcomes (drop, redirect) are
//! not errors and live in [`crate::filter::PacketSignal`].

use thiserror::Error;
use vtn_types::ParseError;

use crate::mapping::{MacVlan, NodeVlan, PortVlan};
use crate::path::{InterfacePath, NodePath, VlanMapPath};

/// Result type alias for VTN operations.
pub type Result<T> = std::result::Result<T, VtnError>;

/// Errors reported by the VTN manager API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VtnError {
    /// A value failed validation (bad index, VLAN, cost, name...).
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// The named object already exists.
    #[error("{kind} already exists: {name}")]
    AlreadyExists {
        /// Kind of object, such as "vBridge".
        kind: &'static str,
        /// Name or path of the object.
        name: String,
    },

    /// The named object does not exist.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Kind of object, such as "interface".
        kind: &'static str,
        /// Name or path of the object.
        name: String,
    },

    /// A required argument was not supplied.
    #[error("{0} must be specified")]
    MissingArgument(&'static str),

    /// The physical port and VLAN are already mapped to another interface.
    #[error("Port {port_vlan} is already mapped to {owner}")]
    PortMapConflict {
        port_vlan: PortVlan,
        owner: InterfacePath,
    },

    /// The node and VLAN are already mapped by another VLAN mapping.
    #[error("VLAN {key} is already mapped to {owner}")]
    VlanMapConflict { key: NodeVlan, owner: VlanMapPath },

    /// The host is already mapped by the MAC mapping of another bridge.
    #[error("Host {host} is already mapped to {owner}")]
    MacMapConflict { host: MacVlan, owner: NodePath },

    /// The MAC address is already bound on a different VLAN.
    #[error("MAC address of {host} is already in use by {existing}")]
    DuplicateMac { host: MacVlan, existing: MacVlan },
}

impl VtnError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(kind: &'static str, name: impl ToString) -> Self {
        Self::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    /// Creates an already-exists error.
    pub fn already_exists(kind: &'static str, name: impl ToString) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    }

    /// Returns true if this error reports a mapping conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::PortMapConflict { .. }
                | Self::VlanMapConflict { .. }
                | Self::MacMapConflict { .. }
                | Self::DuplicateMac { .. }
        )
    }
}

impl From<ParseError> for VtnError {
    fn from(err: ParseError) -> Self {
        let field = match err {
            ParseError::InvalidMacAddress(_) => "mac-address",
            ParseError::InvalidVlanId(_) => "vlan-id",
            ParseError::InvalidNodeId(_) => "node",
            ParseError::InvalidSwitchPort(_) => "port",
        };
        Self::invalid_config(field, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_display() {
        let err = VtnError::invalid_config("index", "must be in 1-65535");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for index: must be in 1-65535"
        );

        let err = VtnError::not_found("vBridge", "vtn1/bridge1");
        assert_eq!(err.to_string(), "vBridge not found: vtn1/bridge1");
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: VtnError = ParseError::InvalidVlanId(5000).into();
        assert!(matches!(err, VtnError::InvalidConfig { ref field, .. } if field == "vlan-id"));
        assert!(!err.is_conflict());
    }
}
