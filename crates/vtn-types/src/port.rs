//! Physical node and port identifiers.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a physical switch, such as `openflow:1`.
///
/// # Examples
///
/// ```
/// use vtn_types::NodeId;
///
/// let node: NodeId = "openflow:1".parse().unwrap();
/// assert_eq!(node.as_str(), "openflow:1");
/// assert!("".parse::<NodeId>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node identifier, rejecting empty or whitespace-bearing names.
    pub fn new(id: impl Into<String>) -> Result<Self, ParseError> {
        let id = id.into();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(ParseError::InvalidNodeId(id));
        }
        Ok(NodeId(id))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeId::new(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        NodeId::new(s)
    }
}

impl From<NodeId> for String {
    fn from(node: NodeId) -> String {
        node.0
    }
}

/// A concrete port on a physical switch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysicalPort {
    /// Switch the port belongs to.
    pub node: NodeId,
    /// Port type, such as `OF`.
    pub port_type: String,
    /// Port identifier within the node, unique per type.
    pub id: String,
}

impl PhysicalPort {
    pub fn new(node: NodeId, port_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            node,
            port_type: port_type.into(),
            id: id.into(),
        }
    }

    /// Returns true if this port is matched by the given descriptor.
    ///
    /// `name` is the current name of the port, if the topology knows one.
    pub fn matches(&self, desc: &SwitchPort, name: Option<&str>) -> bool {
        if let (Some(port_type), Some(id)) = (&desc.port_type, &desc.id) {
            if *port_type != self.port_type || *id != self.id {
                return false;
            }
        }
        match &desc.name {
            Some(wanted) => name == Some(wanted.as_str()),
            None => true,
        }
    }
}

impl fmt::Display for PhysicalPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}@{}", self.port_type, self.id, self.node)
    }
}

/// A partial description of a switch port.
///
/// A port can be described by its type and identifier, by its name, or by
/// all three. Type and identifier must be given together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwitchPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl SwitchPort {
    /// Descriptor that matches a port by name only.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Descriptor that matches a port by type and identifier.
    pub fn by_id(port_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            port_type: Some(port_type.into()),
            id: Some(id.into()),
            name: None,
        }
    }

    /// Descriptor that matches type, identifier and name.
    pub fn exact(
        port_type: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            port_type: Some(port_type.into()),
            id: Some(id.into()),
            name: Some(name.into()),
        }
    }

    /// Verifies that the descriptor can identify a port.
    pub fn validate(&self) -> Result<(), ParseError> {
        match (&self.port_type, &self.id) {
            (Some(_), None) => Err(ParseError::InvalidSwitchPort(
                "port type specified without port ID".to_string(),
            )),
            (None, Some(_)) => Err(ParseError::InvalidSwitchPort(
                "port ID specified without port type".to_string(),
            )),
            (None, None) if self.name.is_none() => Err(ParseError::InvalidSwitchPort(
                "neither port ID nor port name specified".to_string(),
            )),
            _ => {
                if self.name.as_deref() == Some("") || self.id.as_deref() == Some("") {
                    return Err(ParseError::InvalidSwitchPort(
                        "empty port name or ID".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for SwitchPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        if let (Some(port_type), Some(id)) = (&self.port_type, &self.id) {
            write!(f, "type={},id={}", port_type, id)?;
            sep = ",";
        }
        if let Some(name) = &self.name {
            write!(f, "{}name={}", sep, name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn test_node_id_validation() {
        assert!(NodeId::new("openflow:1").is_ok());
        assert!(NodeId::new("").is_err());
        assert!(NodeId::new("open flow").is_err());
    }

    #[test]
    fn test_physical_port_display() {
        let port = PhysicalPort::new(node("openflow:1"), "OF", "3");
        assert_eq!(port.to_string(), "OF-3@openflow:1");
    }

    #[test]
    fn test_switch_port_validate() {
        assert!(SwitchPort::by_name("eth0").validate().is_ok());
        assert!(SwitchPort::by_id("OF", "1").validate().is_ok());
        assert!(SwitchPort::exact("OF", "1", "eth0").validate().is_ok());
        assert!(SwitchPort::default().validate().is_err());

        let half = SwitchPort {
            port_type: Some("OF".to_string()),
            ..Default::default()
        };
        assert!(half.validate().is_err());
    }

    #[test]
    fn test_port_matches_descriptor() {
        let port = PhysicalPort::new(node("openflow:1"), "OF", "3");

        assert!(port.matches(&SwitchPort::by_id("OF", "3"), None));
        assert!(!port.matches(&SwitchPort::by_id("OF", "4"), None));
        assert!(port.matches(&SwitchPort::by_name("eth3"), Some("eth3")));
        assert!(!port.matches(&SwitchPort::by_name("eth3"), None));
        assert!(!port.matches(&SwitchPort::exact("OF", "3", "eth0"), Some("eth3")));
    }

    #[test]
    fn test_switch_port_display() {
        assert_eq!(SwitchPort::by_name("eth0").to_string(), "name=eth0");
        assert_eq!(
            SwitchPort::exact("OF", "1", "eth0").to_string(),
            "type=OF,id=1,name=eth0"
        );
    }
}
