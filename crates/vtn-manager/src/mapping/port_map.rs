//! Port mapping: binds a (physical port, VLAN) pair to one virtual interface.

use serde::{Deserialize, Serialize};
use std::fmt;
use vtn_types::{NodeId, PhysicalPort, SwitchPort, VlanId};

use crate::error::Result;

/// A physical port together with a VLAN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortVlan {
    pub port: PhysicalPort,
    pub vlan: VlanId,
}

impl PortVlan {
    pub fn new(port: PhysicalPort, vlan: VlanId) -> Self {
        Self { port, vlan }
    }
}

impl fmt::Display for PortVlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.port, self.vlan)
    }
}

/// Port mapping configuration of a virtual interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapConfig {
    /// Physical switch that holds the port.
    pub node: NodeId,
    /// Descriptor of the port within `node`.
    pub port: SwitchPort,
    /// VLAN of the frames mapped to the interface.
    #[serde(default)]
    pub vlan: VlanId,
}

impl PortMapConfig {
    pub fn new(node: NodeId, port: SwitchPort, vlan: VlanId) -> Self {
        Self { node, port, vlan }
    }

    pub fn validate(&self) -> Result<()> {
        self.port.validate()?;
        Ok(())
    }
}

impl fmt::Display for PortMapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node={},{},vlan={}", self.node, self.port, self.vlan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_port_vlan_display() {
        let port = PhysicalPort::new(NodeId::new("openflow:1").unwrap(), "OF", "2");
        let pv = PortVlan::new(port, VlanId::new(10).unwrap());
        assert_eq!(pv.to_string(), "OF-2@openflow:1.10");
    }

    #[test]
    fn test_validate_rejects_empty_descriptor() {
        let config = PortMapConfig::new(
            NodeId::new("openflow:1").unwrap(),
            SwitchPort::default(),
            VlanId::UNTAGGED,
        );
        assert!(config.validate().is_err());

        let config = PortMapConfig::new(
            NodeId::new("openflow:1").unwrap(),
            SwitchPort::by_name("eth1"),
            VlanId::UNTAGGED,
        );
        assert!(config.validate().is_ok());
    }
}
