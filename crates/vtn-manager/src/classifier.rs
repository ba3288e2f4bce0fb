//! Maps a received host to the virtual node that owns it.
//!
//! Precedence is fixed: a port mapping on the exact port and VLAN wins,
//! then the MAC mapping that allows the host, then a VLAN mapping. MAC and
//! VLAN mappings only apply to edge ports.

use serde::Serialize;
use tracing::{debug, warn};
use vtn_types::{MacAddress, PhysicalPort, VlanId};

use crate::mapping::{Activation, MacVlan, MappingRegistry, PortVlan};
use crate::path::NodePath;
use crate::topology::TopologyOracle;

/// Which mapping matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MapKind {
    PortMap,
    MacMap,
    VlanMap,
}

/// Result of a successful classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedNode {
    pub path: NodePath,
    /// Interface name for port-mapped hosts.
    pub interface: Option<String>,
    pub kind: MapKind,
    /// Set when the classification activated a MAC-mapped host.
    pub activation: Option<Activation>,
}

impl MappedNode {
    fn new(path: NodePath, interface: Option<String>, kind: MapKind) -> Self {
        Self {
            path,
            interface,
            kind,
            activation: None,
        }
    }
}

/// Classifier over the registry and the current topology.
pub struct PacketClassifier<'a> {
    registry: &'a MappingRegistry,
    topology: &'a dyn TopologyOracle,
}

impl<'a> PacketClassifier<'a> {
    pub fn new(registry: &'a MappingRegistry, topology: &'a dyn TopologyOracle) -> Self {
        Self { registry, topology }
    }

    /// Classifies a packet received from `mac` on `port` and `vlan`.
    ///
    /// A MAC-mapped host is activated on `port`. A MAC address already
    /// active on another VLAN leaves the packet unmapped.
    pub fn classify(&self, port: &PhysicalPort, mac: MacAddress, vlan: VlanId) -> Option<MappedNode> {
        if let Some(mapped) = self.port_mapped(port, vlan) {
            return Some(mapped);
        }
        if !self.topology.is_edge_port(port) {
            debug!("{}: not an edge port, packet from {} ignored", port, mac);
            return None;
        }

        if let Some(owner) = self.mac_owner(mac, vlan) {
            let host = MacVlan::new(mac, vlan);
            return match self.registry.activate_mac_map(&owner, host, port) {
                Ok(activation) => {
                    let mut mapped = MappedNode::new(owner, None, MapKind::MacMap);
                    mapped.activation = Some(activation);
                    Some(mapped)
                }
                Err(err) => {
                    warn!("{}: {} on {} not mapped: {}", owner, host, port, err);
                    None
                }
            };
        }

        self.vlan_mapped(port, vlan)
    }

    /// Returns the node that would own `mac` on `port_vlan` without
    /// activating anything. MAC-mapped hosts must be active on the port.
    pub fn lookup(&self, port_vlan: &PortVlan, mac: MacAddress) -> Option<MappedNode> {
        let PortVlan { port, vlan } = port_vlan;
        if let Some(mapped) = self.port_mapped(port, *vlan) {
            return Some(mapped);
        }
        if !self.topology.is_edge_port(port) {
            return None;
        }
        if let Some(owner) = self.mac_owner(mac, *vlan) {
            let active = self
                .registry
                .mac_map(&owner)
                .and_then(|mapping| mapping.activation().find(mac))
                .is_some_and(|(host, at)| host.vlan() == *vlan && at == *port);
            return active.then(|| MappedNode::new(owner, None, MapKind::MacMap));
        }
        self.vlan_mapped(port, *vlan)
    }

    fn port_mapped(&self, port: &PhysicalPort, vlan: VlanId) -> Option<MappedNode> {
        let iface = self
            .registry
            .find_port_map(&PortVlan::new(port.clone(), vlan))?;
        let path = iface.node_path();
        Some(MappedNode::new(path, Some(iface.interface), MapKind::PortMap))
    }

    /// Bridge whose MAC mapping maps the host, skipping denied hosts.
    fn mac_owner(&self, mac: MacAddress, vlan: VlanId) -> Option<NodePath> {
        if !mac.is_host_address() {
            return None;
        }
        let host = MacVlan::new(mac, vlan);
        let owner = self.registry.find_mac_owner(&host)?;
        let mapping = self.registry.mac_map(&owner)?;
        if mapping.is_denied(&host) {
            debug!("{}: {} is denied", owner, host);
            return None;
        }
        Some(owner)
    }

    fn vlan_mapped(&self, port: &PhysicalPort, vlan: VlanId) -> Option<MappedNode> {
        let vmap = self.registry.find_vlan_map(&port.node, vlan)?;
        Some(MappedNode::new(vmap.bridge, None, MapKind::VlanMap))
    }
}
