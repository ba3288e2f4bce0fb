//! VLAN mapping: binds a (physical node or any node, VLAN) pair to a bridge.

use serde::{Deserialize, Serialize};
use std::fmt;
use vtn_types::{NodeId, VlanId};

use crate::state::VnodeState;
use crate::topology::TopologyOracle;

/// Key of a VLAN mapping. `node == None` maps the VLAN on every node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeVlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(default)]
    pub vlan: VlanId,
}

impl NodeVlan {
    pub fn new(node: Option<NodeId>, vlan: VlanId) -> Self {
        Self { node, vlan }
    }

    /// Identifier of the mapping within its bridge.
    pub fn map_id(&self) -> String {
        match &self.node {
            Some(node) => format!("{}.{}", node, self.vlan),
            None => format!("ANY.{}", self.vlan),
        }
    }
}

impl fmt::Display for NodeVlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.map_id())
    }
}

/// A VLAN mapping configured on a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanMapping {
    key: NodeVlan,
    /// Whether the registry currently grants this mapping its key.
    registered: bool,
}

impl VlanMapping {
    pub fn new(key: NodeVlan) -> Self {
        Self {
            key,
            registered: false,
        }
    }

    pub fn key(&self) -> &NodeVlan {
        &self.key
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub(crate) fn set_registered(&mut self, registered: bool) {
        self.registered = registered;
    }

    /// Raw state of the mapping as a contributor to its bridge.
    pub fn state(&self, topology: &dyn TopologyOracle) -> VnodeState {
        if !self.registered {
            return VnodeState::Down;
        }
        if let Some(node) = &self.key.node {
            if !topology.node_exists(node) {
                return VnodeState::Down;
            }
        }
        if topology.has_edge_port(self.key.node.as_ref()) {
            VnodeState::Up
        } else {
            VnodeState::Down
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::StaticTopology;
    use pretty_assertions::assert_eq;
    use vtn_types::PhysicalPort;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn test_map_id() {
        let vlan = VlanId::new(10).unwrap();
        assert_eq!(NodeVlan::new(None, vlan).map_id(), "ANY.10");
        assert_eq!(
            NodeVlan::new(Some(node("openflow:1")), vlan).map_id(),
            "openflow:1.10"
        );
    }

    #[test]
    fn test_state_follows_edge_ports() {
        let topology = StaticTopology::new();
        topology.add_node(node("openflow:1"));
        topology.add_node(node("openflow:2"));

        let mut vmap = VlanMapping::new(NodeVlan::new(Some(node("openflow:1")), VlanId::UNTAGGED));
        assert_eq!(vmap.state(&topology), VnodeState::Down);

        vmap.set_registered(true);
        assert_eq!(vmap.state(&topology), VnodeState::Down);

        topology.add_port(PhysicalPort::new(node("openflow:2"), "OF", "1"), "eth1", true);
        assert_eq!(vmap.state(&topology), VnodeState::Down);

        let mut any = VlanMapping::new(NodeVlan::new(None, VlanId::UNTAGGED));
        any.set_registered(true);
        assert_eq!(any.state(&topology), VnodeState::Up);

        topology.add_port(PhysicalPort::new(node("openflow:1"), "OF", "1"), "eth1", true);
        assert_eq!(vmap.state(&topology), VnodeState::Up);
    }
}
