//! Virtual bridges and terminals.
//!
//! A [`VNode`] owns its interfaces, VLAN mappings, faulted paths, learned
//! MAC table and filter chains. The MAC mapping of a bridge lives in the
//! [`MappingRegistry`] so that classification can reach it without taking
//! the node lock. Every mutation is followed by [`VNode::refresh`], which
//! derives the operational state and reports what changed.

mod fault;
mod interface;
mod mac_table;

pub use fault::FaultedPathSet;
pub use interface::{PortMapUpdate, VInterface};
pub use mac_table::{MacTable, MacTableEntry, DEFAULT_MAC_TABLE_LIMIT};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::error::{Result, VtnError};
use crate::event::VtnEvent;
use crate::filter::{Direction, FilterChain};
use crate::mapping::{Inactivation, MappingRegistry, NodeVlan, VlanMapping};
use crate::path::{NodePath, VlanMapPath};
use crate::state::{fold_states, VnodeState};
use crate::topology::TopologyOracle;

/// Kind of a virtual node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Layer 2 switch with any number of interfaces and mappings.
    Bridge,
    /// Endpoint with at most one interface, used as a redirect target.
    Terminal,
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Bridge => "vBridge",
            NodeKind::Terminal => "vTerminal",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What state derivation needs from outside the node.
#[derive(Clone, Copy)]
pub(crate) struct StateEnv<'a> {
    pub topology: &'a dyn TopologyOracle,
    pub registry: &'a MappingRegistry,
}

/// A virtual bridge or terminal.
#[derive(Debug)]
pub struct VNode {
    path: NodePath,
    kind: NodeKind,
    description: Option<String>,
    interfaces: BTreeMap<String, VInterface>,
    vlan_maps: BTreeMap<String, VlanMapping>,
    faults: FaultedPathSet,
    mac_table: MacTable,
    in_filters: FilterChain,
    out_filters: FilterChain,
    state: VnodeState,
}

impl VNode {
    pub fn new(path: NodePath, kind: NodeKind, description: Option<String>) -> Self {
        let owner = path.to_string();
        Self {
            in_filters: FilterChain::new(path.tenant.clone(), owner.clone(), Direction::In),
            out_filters: FilterChain::new(path.tenant.clone(), owner, Direction::Out),
            path,
            kind,
            description,
            interfaces: BTreeMap::new(),
            vlan_maps: BTreeMap::new(),
            faults: FaultedPathSet::new(),
            mac_table: MacTable::new(),
            state: VnodeState::Unknown,
        }
    }

    /// Bounds the MAC table to `limit` hosts. Learned hosts are dropped.
    pub(crate) fn with_mac_table_limit(mut self, limit: usize) -> Self {
        self.mac_table = MacTable::with_limit(limit);
        self
    }

    pub fn path(&self) -> &NodePath {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.path.node
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_bridge(&self) -> bool {
        self.kind == NodeKind::Bridge
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn set_description(&mut self, description: Option<String>) -> bool {
        let changed = self.description != description;
        self.description = description;
        changed
    }

    pub fn state(&self) -> VnodeState {
        self.state
    }

    // ---- interfaces ----

    pub fn interfaces(&self) -> impl Iterator<Item = &VInterface> {
        self.interfaces.values()
    }

    pub fn interface(&self, name: &str) -> Option<&VInterface> {
        self.interfaces.get(name)
    }

    pub(crate) fn interface_mut(&mut self, name: &str) -> Option<&mut VInterface> {
        self.interfaces.get_mut(name)
    }

    pub(crate) fn interfaces_mut(&mut self) -> impl Iterator<Item = &mut VInterface> {
        self.interfaces.values_mut()
    }

    pub(crate) fn add_interface(&mut self, iface: VInterface) -> Result<()> {
        if self.interfaces.contains_key(iface.name()) {
            return Err(VtnError::already_exists("vInterface", iface.path()));
        }
        if self.kind == NodeKind::Terminal && !self.interfaces.is_empty() {
            return Err(VtnError::invalid_config(
                "vInterface",
                format!("{}: a vTerminal can have only one interface", self.path),
            ));
        }
        self.interfaces.insert(iface.name().to_string(), iface);
        Ok(())
    }

    /// Detaches an interface and releases its port mapping.
    pub(crate) fn remove_interface(
        &mut self,
        name: &str,
        registry: &MappingRegistry,
    ) -> Result<VInterface> {
        let mut iface = self
            .interfaces
            .remove(name)
            .ok_or_else(|| VtnError::not_found("vInterface", self.path.interface(name)))?;
        if let Some(released) = iface.release_port_map(registry) {
            self.mac_table.flush_port_vlan(&released);
        }
        Ok(iface)
    }

    // ---- VLAN mappings ----

    pub fn vlan_maps(&self) -> impl Iterator<Item = &VlanMapping> {
        self.vlan_maps.values()
    }

    pub fn vlan_map(&self, map_id: &str) -> Option<&VlanMapping> {
        self.vlan_maps.get(map_id)
    }

    /// Adds a VLAN mapping and claims its key.
    ///
    /// Fails without changing anything if another bridge owns the key.
    pub(crate) fn add_vlan_map(&mut self, key: NodeVlan, registry: &MappingRegistry) -> Result<VlanMapPath> {
        let path = self.check_new_vlan_map(&key)?;
        if let Some(owner) = registry.register_vlan_map(&path, &key) {
            return Err(VtnError::VlanMapConflict { key, owner });
        }
        let mut vmap = VlanMapping::new(key);
        vmap.set_registered(true);
        self.vlan_maps.insert(path.map_id.clone(), vmap);
        Ok(path)
    }

    /// Adds a VLAN mapping from saved configuration without claiming it.
    /// [`VNode::register_vlan_maps`] claims it later.
    pub(crate) fn restore_vlan_map(&mut self, key: NodeVlan) -> Result<VlanMapPath> {
        let path = self.check_new_vlan_map(&key)?;
        self.vlan_maps.insert(path.map_id.clone(), VlanMapping::new(key));
        Ok(path)
    }

    /// Claims every VLAN mapping that is not registered yet. Conflicts are
    /// logged and leave the mapping unregistered. Returns the number of
    /// mappings claimed.
    pub(crate) fn register_vlan_maps(&mut self, registry: &MappingRegistry) -> usize {
        let mut claimed = 0;
        for (map_id, vmap) in self.vlan_maps.iter_mut().filter(|(_, v)| !v.is_registered()) {
            let path = VlanMapPath::new(self.path.clone(), map_id.clone());
            match registry.register_vlan_map(&path, vmap.key()) {
                None => {
                    vmap.set_registered(true);
                    claimed += 1;
                }
                Some(owner) => warn!("{}: {} is already mapped to {}", path, vmap.key(), owner),
            }
        }
        claimed
    }

    fn check_new_vlan_map(&self, key: &NodeVlan) -> Result<VlanMapPath> {
        self.require_bridge("VLAN mapping")?;
        let path = VlanMapPath::new(self.path.clone(), key.map_id());
        if self.vlan_maps.contains_key(&path.map_id) {
            return Err(VtnError::already_exists("VLAN mapping", &path));
        }
        Ok(path)
    }

    pub(crate) fn remove_vlan_map(
        &mut self,
        map_id: &str,
        registry: &MappingRegistry,
    ) -> Result<VlanMapping> {
        let path = VlanMapPath::new(self.path.clone(), map_id);
        let vmap = self
            .vlan_maps
            .remove(map_id)
            .ok_or_else(|| VtnError::not_found("VLAN mapping", &path))?;
        if vmap.is_registered() {
            registry.unregister_vlan_map(&path, vmap.key());
            let key = vmap.key();
            self.mac_table.retain(|entry| {
                entry.port_vlan.vlan != key.vlan
                    || key.node.as_ref().is_some_and(|n| *n != entry.port_vlan.port.node)
            });
        }
        Ok(vmap)
    }

    // ---- runtime ----

    pub fn faults(&self) -> &FaultedPathSet {
        &self.faults
    }

    pub(crate) fn faults_mut(&mut self) -> &mut FaultedPathSet {
        &mut self.faults
    }

    pub fn mac_table(&self) -> &MacTable {
        &self.mac_table
    }

    pub fn filters(&self, direction: Direction) -> &FilterChain {
        match direction {
            Direction::In => &self.in_filters,
            Direction::Out => &self.out_filters,
        }
    }

    pub(crate) fn filters_mut(&mut self, direction: Direction) -> Result<&mut FilterChain> {
        self.require_bridge("flow filter")?;
        Ok(match direction {
            Direction::In => &mut self.in_filters,
            Direction::Out => &mut self.out_filters,
        })
    }

    /// Derives the state of every interface and of the node itself.
    ///
    /// Interfaces are folded by name, then the MAC mapping, then VLAN
    /// mappings by map id. Disabled interfaces do not take part.
    pub(crate) fn refresh(&mut self, env: StateEnv<'_>, events: &mut Vec<VtnEvent>) {
        for iface in self.interfaces.values_mut() {
            if let Some(state) = iface.update_state(env.topology) {
                events.push(VtnEvent::InterfaceStateChanged {
                    path: iface.path().clone(),
                    state,
                });
            }
        }

        let mac_map = env.registry.mac_map(&self.path);
        let contributors = self
            .interfaces
            .values()
            .filter(|iface| iface.is_enabled())
            .map(|iface| iface.state())
            .chain(mac_map.iter().map(|mapping| mapping.state()))
            .chain(self.vlan_maps.values().map(|vmap| vmap.state(env.topology)));
        let state = fold_states(!self.faults.is_empty(), contributors);
        if state != self.state {
            debug!("{}: state {} -> {}", self.path, self.state, state);
            self.state = state;
            events.push(VtnEvent::NodeStateChanged {
                path: self.path.clone(),
                state,
            });
        }
    }

    /// Releases every mapping held by the node. Used when it is removed.
    pub(crate) fn release_all(&mut self, registry: &MappingRegistry) -> Inactivation {
        for iface in self.interfaces.values_mut() {
            iface.release_port_map(registry);
        }
        for (map_id, vmap) in &self.vlan_maps {
            if vmap.is_registered() {
                registry.unregister_vlan_map(&VlanMapPath::new(self.path.clone(), map_id.clone()), vmap.key());
            }
        }
        self.mac_table.clear();
        registry.unregister_mac_map(&self.path)
    }

    fn require_bridge(&self, what: &str) -> Result<()> {
        if self.kind != NodeKind::Bridge {
            return Err(VtnError::invalid_config(
                what,
                format!("{}: not supported by {}", self.path, self.kind),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{MacMapChange, MacVlan};
    use crate::path::InterfacePath;
    use crate::topology::StaticTopology;
    use pretty_assertions::assert_eq;
    use vtn_types::{MacAddress, NodeId, PhysicalPort, VlanId};

    fn node_id() -> NodeId {
        NodeId::new("openflow:1").unwrap()
    }

    fn bridge(name: &str) -> VNode {
        VNode::new(NodePath::new("vtn1", name), NodeKind::Bridge, None)
    }

    fn add_iface(node: &mut VNode, name: &str, enabled: bool) {
        let path = node.path().interface(name);
        node.add_interface(VInterface::new(path, enabled, None)).unwrap();
    }

    fn refresh(node: &mut VNode, topology: &StaticTopology, registry: &MappingRegistry) -> Vec<VtnEvent> {
        let mut events = Vec::new();
        node.refresh(StateEnv { topology, registry }, &mut events);
        events
    }

    #[test]
    fn test_empty_bridge_is_unknown() {
        let topology = StaticTopology::new();
        let registry = MappingRegistry::new();
        let mut node = bridge("bridge1");
        add_iface(&mut node, "if1", true);
        assert!(refresh(&mut node, &topology, &registry).is_empty());
        assert_eq!(node.state(), VnodeState::Unknown);
    }

    #[test]
    fn test_disabled_interface_is_ignored() {
        let topology = StaticTopology::new();
        let registry = MappingRegistry::new();
        let mut node = bridge("bridge1");
        add_iface(&mut node, "if1", false);
        let events = refresh(&mut node, &topology, &registry);
        assert_eq!(node.interface("if1").map(|i| i.state()), Some(VnodeState::Down));
        assert_eq!(node.state(), VnodeState::Unknown);
        assert_eq!(
            events,
            vec![VtnEvent::InterfaceStateChanged {
                path: InterfacePath::new("vtn1", "bridge1", "if1"),
                state: VnodeState::Down,
            }]
        );
    }

    #[test]
    fn test_fault_forces_down_and_recovers() {
        let topology = StaticTopology::new();
        topology.add_port(PhysicalPort::new(node_id(), "OF", "1"), "eth1", true);
        let registry = MappingRegistry::new();
        let mut node = bridge("bridge1");
        node.add_vlan_map(NodeVlan::new(None, VlanId::UNTAGGED), &registry)
            .unwrap();
        refresh(&mut node, &topology, &registry);
        assert_eq!(node.state(), VnodeState::Up);

        node.faults_mut().add(node_id(), NodeId::new("openflow:2").unwrap());
        refresh(&mut node, &topology, &registry);
        assert_eq!(node.state(), VnodeState::Down);

        node.faults_mut().remove_node(&node_id());
        let events = refresh(&mut node, &topology, &registry);
        assert_eq!(node.state(), VnodeState::Up);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_mac_map_contributes() {
        let topology = StaticTopology::new();
        let registry = MappingRegistry::new();
        let mut node = bridge("bridge1");
        registry
            .register_mac_map(node.path(), &MacMapChange::new().allow(MacVlan::any(VlanId::UNTAGGED)))
            .unwrap();
        refresh(&mut node, &topology, &registry);
        assert_eq!(node.state(), VnodeState::Down);

        let host = MacVlan::new(MacAddress::from_u64(1), VlanId::UNTAGGED);
        registry
            .activate_mac_map(node.path(), host, &PhysicalPort::new(node_id(), "OF", "1"))
            .unwrap();
        refresh(&mut node, &topology, &registry);
        assert_eq!(node.state(), VnodeState::Up);

        let inactivated = node.release_all(&registry);
        assert_eq!(inactivated.hosts.len(), 1);
        assert!(registry.mac_map(node.path()).is_none());
    }

    #[test]
    fn test_vlan_map_conflict() {
        let registry = MappingRegistry::new();
        let mut b1 = bridge("bridge1");
        let mut b2 = bridge("bridge2");
        let key = NodeVlan::new(None, VlanId::new(10).unwrap());
        b1.add_vlan_map(key.clone(), &registry).unwrap();

        let err = b2
            .add_vlan_map(key.clone(), &registry)
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(b2.vlan_map("ANY.10").is_none());

        b2.restore_vlan_map(key.clone()).unwrap();
        assert_eq!(b2.register_vlan_maps(&registry), 0);
        assert_eq!(b2.vlan_map("ANY.10").map(|v| v.is_registered()), Some(false));
        assert!(b1.add_vlan_map(key, &registry).is_err());

        b1.remove_vlan_map("ANY.10", &registry).unwrap();
        assert!(registry.find_vlan_map(&node_id(), VlanId::new(10).unwrap()).is_none());
        assert_eq!(b2.register_vlan_maps(&registry), 1);
        assert!(registry.find_vlan_map(&node_id(), VlanId::new(10).unwrap()).is_some());
    }

    #[test]
    fn test_terminal_limits() {
        let registry = MappingRegistry::new();
        let mut term = VNode::new(NodePath::new("vtn1", "term1"), NodeKind::Terminal, None);
        add_iface(&mut term, "if1", true);
        let second = VInterface::new(term.path().interface("if2"), true, None);
        assert!(term.add_interface(second).is_err());
        assert!(term
            .add_vlan_map(NodeVlan::new(None, VlanId::UNTAGGED), &registry)
            .is_err());
        assert!(term.filters_mut(Direction::In).is_err());
        assert!(term.remove_interface("if1", &registry).is_ok());
        assert!(term.remove_interface("if1", &registry).is_err());
    }
}
