//! Paths that identify virtual network elements.
//!
//! Elements never hold pointers to their parents. Operations receive the
//! path of the element they act on and look the parent up explicitly.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, VtnError};

/// Maximum length of a virtual element name.
pub const MAX_NAME_LENGTH: usize = 31;

/// Verifies that `name` is usable as the name of a virtual element.
///
/// Names are 1-31 characters of ASCII alphanumerics and underscores and
/// must not start with an underscore.
pub fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VtnError::invalid_config(kind, "name cannot be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(VtnError::invalid_config(
            kind,
            format!("name is too long: {}", name),
        ));
    }
    if name.starts_with('_') || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(VtnError::invalid_config(
            kind,
            format!("name contains invalid character: {}", name),
        ));
    }
    Ok(())
}

/// Path to a virtual node (bridge or terminal) inside a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodePath {
    pub tenant: String,
    pub node: String,
}

impl NodePath {
    pub fn new(tenant: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            node: node.into(),
        }
    }

    /// Path to the interface `name` of this node.
    pub fn interface(&self, name: impl Into<String>) -> InterfacePath {
        InterfacePath {
            tenant: self.tenant.clone(),
            node: self.node.clone(),
            interface: name.into(),
        }
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.node)
    }
}

/// Path to a virtual interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfacePath {
    pub tenant: String,
    pub node: String,
    pub interface: String,
}

impl InterfacePath {
    pub fn new(
        tenant: impl Into<String>,
        node: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            node: node.into(),
            interface: interface.into(),
        }
    }

    /// Path to the node that owns this interface.
    pub fn node_path(&self) -> NodePath {
        NodePath::new(self.tenant.clone(), self.node.clone())
    }
}

impl fmt::Display for InterfacePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.node, self.interface)
    }
}

/// Path to a VLAN mapping of a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VlanMapPath {
    pub bridge: NodePath,
    pub map_id: String,
}

impl VlanMapPath {
    pub fn new(bridge: NodePath, map_id: impl Into<String>) -> Self {
        Self {
            bridge,
            map_id: map_id.into(),
        }
    }
}

impl fmt::Display for VlanMapPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/vlanmap:{}", self.bridge, self.map_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_check_name() {
        assert!(check_name("vBridge", "bridge_1").is_ok());
        assert!(check_name("vBridge", "").is_err());
        assert!(check_name("vBridge", "_hidden").is_err());
        assert!(check_name("vBridge", "bad-name").is_err());
        assert!(check_name("vBridge", &"a".repeat(32)).is_err());
        assert!(check_name("vBridge", &"a".repeat(31)).is_ok());
    }

    #[test]
    fn test_path_display() {
        let bridge = NodePath::new("vtn1", "bridge1");
        assert_eq!(bridge.to_string(), "vtn1/bridge1");

        let iface = bridge.interface("if1");
        assert_eq!(iface.to_string(), "vtn1/bridge1/if1");
        assert_eq!(iface.node_path(), bridge);

        let vmap = VlanMapPath::new(bridge, "ANY.10");
        assert_eq!(vmap.to_string(), "vtn1/bridge1/vlanmap:ANY.10");
    }
}
