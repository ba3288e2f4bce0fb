//! Administrative API: tenants, nodes, interfaces, mappings, flow filters
//! and path policies.
//!
//! Every operation validates first, applies under the smallest set of
//! locks, recomputes the affected states and then dispatches the collected
//! events and saves the tenant.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use vtn_types::{MacAddress, NodeId, PhysicalPort, VlanId};

use super::{NodeRef, VtnManager};
use crate::classifier::{MappedNode, PacketClassifier};
use crate::cost::{PathPolicyConfig, PathPolicySet, POLICY_ID_MAX};
use crate::error::{Result, VtnError};
use crate::event::{UpdateKind, VtnEvent};
use crate::filter::{Direction, FilterChain, FilterKind, FilterRule};
use crate::mapping::{MacMapChange, MacMapConfig, MacVlan, NodeVlan, PortMapConfig, PortVlan};
use crate::path::{check_name, InterfacePath, NodePath, VlanMapPath};
use crate::state::VnodeState;
use crate::vnode::{MacTableEntry, NodeKind, VInterface, VNode};

/// A virtual tenant network.
#[derive(Debug)]
pub struct Tenant {
    name: String,
    description: RwLock<Option<String>>,
    /// Evaluated once per packet, before any redirection.
    in_filters: RwLock<FilterChain>,
    nodes: RwLock<BTreeMap<String, NodeRef>>,
}

impl Tenant {
    pub(crate) fn new(name: impl Into<String>, description: Option<String>) -> Self {
        let name = name.into();
        Self {
            in_filters: RwLock::new(FilterChain::new(name.clone(), name.clone(), Direction::In)),
            description: RwLock::new(description),
            nodes: RwLock::new(BTreeMap::new()),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<String> {
        self.description.read().clone()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.read().keys().cloned().collect()
    }

    pub(crate) fn node(&self, name: &str) -> Option<NodeRef> {
        self.nodes.read().get(name).cloned()
    }

    pub(crate) fn node_refs(&self) -> Vec<NodeRef> {
        self.nodes.read().values().cloned().collect()
    }

    pub(crate) fn in_filters(&self) -> &RwLock<FilterChain> {
        &self.in_filters
    }

    pub(crate) fn nodes(&self) -> &RwLock<BTreeMap<String, NodeRef>> {
        &self.nodes
    }
}

/// Owner of a flow filter chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterTarget {
    /// Tenant chain, incoming direction only.
    Tenant(String),
    /// Bridge chain.
    Node(NodePath),
    /// Interface chain of a bridge or terminal.
    Interface(InterfacePath),
}

impl VtnManager {
    // ---- tenants ----

    #[instrument(skip(self))]
    pub fn add_tenant(&self, name: &str, description: Option<String>) -> Result<()> {
        check_name("VTN", name)?;
        {
            let mut tenants = self.tenants.write();
            if tenants.contains_key(name) {
                return Err(VtnError::already_exists("VTN", name));
            }
            tenants.insert(name.to_string(), Arc::new(Tenant::new(name, description)));
        }
        info!("{}: VTN created", name);
        self.dispatch(vec![VtnEvent::TenantChanged {
            tenant: name.to_string(),
            kind: UpdateKind::Added,
        }]);
        self.persist(name);
        Ok(())
    }

    /// Removes a tenant and releases every mapping of its nodes.
    #[instrument(skip(self))]
    pub fn remove_tenant(&self, name: &str) -> Result<()> {
        let tenant = self
            .tenants
            .write()
            .remove(name)
            .ok_or_else(|| VtnError::not_found("VTN", name))?;

        let mut events = Vec::new();
        let nodes = std::mem::take(&mut *tenant.nodes().write());
        for node in nodes.into_values() {
            let mut node = node.write();
            let inactivation = node.release_all(&self.registry);
            Self::note_inactivation(&node, &inactivation, &mut events);
            events.push(VtnEvent::NodeChanged {
                path: node.path().clone(),
                node_kind: node.kind(),
                kind: UpdateKind::Removed,
            });
        }
        self.registry.purge_tenant(name);
        self.discard_pending_mac_maps(|path| path.tenant == name);
        events.push(VtnEvent::TenantChanged {
            tenant: name.to_string(),
            kind: UpdateKind::Removed,
        });
        info!("{}: VTN removed", name);

        self.dispatch(events);
        if let Some(persistence) = self.persistence.read().clone() {
            persistence.remove(name);
        }
        Ok(())
    }

    /// Returns true if the description changed.
    #[instrument(skip(self))]
    pub fn set_tenant_description(&self, name: &str, description: Option<String>) -> Result<bool> {
        let tenant = self.tenant(name)?;
        let changed = {
            let mut current = tenant.description.write();
            let changed = *current != description;
            *current = description;
            changed
        };
        if changed {
            self.dispatch(vec![VtnEvent::TenantChanged {
                tenant: name.to_string(),
                kind: UpdateKind::Changed,
            }]);
            self.persist(name);
        }
        Ok(changed)
    }

    pub fn tenant_names(&self) -> Vec<String> {
        self.tenants.read().keys().cloned().collect()
    }

    pub fn node_names(&self, tenant: &str) -> Result<Vec<String>> {
        Ok(self.tenant(tenant)?.node_names())
    }

    // ---- nodes ----

    pub fn add_bridge(&self, path: &NodePath, description: Option<String>) -> Result<()> {
        self.add_node(path, NodeKind::Bridge, description)
    }

    pub fn add_terminal(&self, path: &NodePath, description: Option<String>) -> Result<()> {
        self.add_node(path, NodeKind::Terminal, description)
    }

    #[instrument(skip(self))]
    fn add_node(&self, path: &NodePath, kind: NodeKind, description: Option<String>) -> Result<()> {
        check_name(kind.label(), &path.node)?;
        let tenant = self.tenant(&path.tenant)?;
        let mut events = Vec::new();
        {
            let mut nodes = tenant.nodes().write();
            if nodes.contains_key(&path.node) {
                return Err(VtnError::already_exists(kind.label(), path));
            }
            let mut node =
                VNode::new(path.clone(), kind, description).with_mac_table_limit(self.mac_table_limit);
            node.refresh(self.env(), &mut events);
            nodes.insert(path.node.clone(), Arc::new(RwLock::new(node)));
        }
        info!("{}: {} created", path, kind);
        events.insert(
            0,
            VtnEvent::NodeChanged {
                path: path.clone(),
                node_kind: kind,
                kind: UpdateKind::Added,
            },
        );
        self.dispatch(events);
        self.persist(&path.tenant);
        Ok(())
    }

    /// Removes a bridge or terminal and releases its mappings.
    #[instrument(skip(self))]
    pub fn remove_node(&self, path: &NodePath) -> Result<()> {
        let tenant = self.tenant(&path.tenant)?;
        let node = tenant
            .nodes()
            .write()
            .remove(&path.node)
            .ok_or_else(|| VtnError::not_found("vNode", path))?;

        let mut events = Vec::new();
        let kind = {
            let mut node = node.write();
            let inactivation = node.release_all(&self.registry);
            Self::note_inactivation(&node, &inactivation, &mut events);
            node.kind()
        };
        self.discard_pending_mac_maps(|pending| pending == path);
        info!("{}: {} removed", path, kind);
        events.push(VtnEvent::NodeChanged {
            path: path.clone(),
            node_kind: kind,
            kind: UpdateKind::Removed,
        });
        self.dispatch(events);
        self.persist(&path.tenant);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn set_node_description(&self, path: &NodePath, description: Option<String>) -> Result<bool> {
        let node = self.node(path)?;
        let (changed, kind) = {
            let mut node = node.write();
            (node.set_description(description), node.kind())
        };
        if changed {
            self.dispatch(vec![VtnEvent::NodeChanged {
                path: path.clone(),
                node_kind: kind,
                kind: UpdateKind::Changed,
            }]);
            self.persist(&path.tenant);
        }
        Ok(changed)
    }

    // ---- interfaces ----

    #[instrument(skip(self))]
    pub fn add_interface(&self, path: &InterfacePath, enabled: bool, description: Option<String>) -> Result<()> {
        check_name("vInterface", &path.interface)?;
        let node = self.node(&path.node_path())?;
        let mut events = vec![VtnEvent::InterfaceChanged {
            path: path.clone(),
            kind: UpdateKind::Added,
        }];
        {
            let mut node = node.write();
            node.add_interface(VInterface::new(path.clone(), enabled, description))?;
            node.refresh(self.env(), &mut events);
        }
        self.dispatch(events);
        self.persist(&path.tenant);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn remove_interface(&self, path: &InterfacePath) -> Result<()> {
        let node = self.node(&path.node_path())?;
        let mut events = Vec::new();
        {
            let mut node = node.write();
            node.remove_interface(&path.interface, &self.registry)?;
            node.refresh(self.env(), &mut events);
        }
        events.insert(
            0,
            VtnEvent::InterfaceChanged {
                path: path.clone(),
                kind: UpdateKind::Removed,
            },
        );
        self.dispatch(events);
        self.persist(&path.tenant);
        Ok(())
    }

    /// Enables or disables an interface. Returns true if the flag changed.
    #[instrument(skip(self))]
    pub fn set_interface_enabled(&self, path: &InterfacePath, enabled: bool) -> Result<bool> {
        let node = self.node(&path.node_path())?;
        let mut events = Vec::new();
        let changed = {
            let mut node = node.write();
            let iface = node
                .interface_mut(&path.interface)
                .ok_or_else(|| VtnError::not_found("vInterface", path))?;
            let changed = iface.set_enabled(enabled);
            if changed {
                node.refresh(self.env(), &mut events);
            }
            changed
        };
        if changed {
            events.insert(
                0,
                VtnEvent::InterfaceChanged {
                    path: path.clone(),
                    kind: UpdateKind::Changed,
                },
            );
            self.dispatch(events);
            self.persist(&path.tenant);
        }
        Ok(changed)
    }

    #[instrument(skip(self))]
    pub fn set_interface_description(&self, path: &InterfacePath, description: Option<String>) -> Result<bool> {
        let node = self.node(&path.node_path())?;
        let changed = node
            .write()
            .interface_mut(&path.interface)
            .ok_or_else(|| VtnError::not_found("vInterface", path))?
            .set_description(description);
        if changed {
            self.dispatch(vec![VtnEvent::InterfaceChanged {
                path: path.clone(),
                kind: UpdateKind::Changed,
            }]);
            self.persist(&path.tenant);
        }
        Ok(changed)
    }

    // ---- port mapping ----

    /// Sets or removes the port mapping of an interface.
    ///
    /// Fails with `PortMapConflict` if the port and VLAN are mapped to
    /// another interface. Hosts that MAC mappings had activated on the
    /// newly mapped port and VLAN are inactivated.
    #[instrument(skip(self))]
    pub fn set_port_map(&self, path: &InterfacePath, config: Option<PortMapConfig>) -> Result<Option<UpdateKind>> {
        let node = self.node(&path.node_path())?;
        let mut events = Vec::new();
        let update = {
            let mut node = node.write();
            let iface = node
                .interface_mut(&path.interface)
                .ok_or_else(|| VtnError::not_found("vInterface", path))?;
            let update = iface.set_port_map(config, &self.registry, self.topology.as_ref())?;
            if let Some(released) = &update.released {
                node.mac_table().flush_port_vlan(released);
            }
            node.refresh(self.env(), &mut events);
            update
        };
        let Some(kind) = update.kind else {
            return Ok(None);
        };

        events.insert(
            0,
            VtnEvent::PortMapChanged {
                path: path.clone(),
                kind,
            },
        );
        if let Some(established) = &update.established {
            self.take_over_port_vlan(established, &mut events);
        }
        self.dispatch(events);
        self.persist(&path.tenant);
        Ok(Some(kind))
    }

    /// Makes a port and VLAN exclusive to the port mapping that just
    /// claimed it.
    pub(crate) fn take_over_port_vlan(&self, port_vlan: &PortVlan, events: &mut Vec<VtnEvent>) {
        let inactivations = self.registry.inactivate_port_vlan(port_vlan);
        self.apply_inactivations(inactivations, events);
        for node in self.all_nodes() {
            node.read().mac_table().flush_port_vlan(port_vlan);
        }
    }

    pub fn port_map(&self, path: &InterfacePath) -> Result<Option<PortMapConfig>> {
        let node = self.node(&path.node_path())?;
        let node = node.read();
        let iface = node
            .interface(&path.interface)
            .ok_or_else(|| VtnError::not_found("vInterface", path))?;
        Ok(iface.port_map().cloned())
    }

    // ---- VLAN mapping ----

    /// Adds a VLAN mapping to a bridge. Fails with `VlanMapConflict` if the
    /// node and VLAN are mapped by another bridge.
    #[instrument(skip(self))]
    pub fn add_vlan_map(&self, bridge: &NodePath, key: NodeVlan) -> Result<VlanMapPath> {
        let node = self.node(bridge)?;
        let mut events = Vec::new();
        let path = {
            let mut node = node.write();
            let path = node.add_vlan_map(key, &self.registry)?;
            node.refresh(self.env(), &mut events);
            path
        };
        events.insert(
            0,
            VtnEvent::VlanMapChanged {
                path: path.clone(),
                kind: UpdateKind::Added,
            },
        );
        self.dispatch(events);
        self.persist(&bridge.tenant);
        Ok(path)
    }

    #[instrument(skip(self))]
    pub fn remove_vlan_map(&self, path: &VlanMapPath) -> Result<()> {
        let node = self.node(&path.bridge)?;
        let mut events = Vec::new();
        {
            let mut node = node.write();
            node.remove_vlan_map(&path.map_id, &self.registry)?;
            node.refresh(self.env(), &mut events);
        }
        events.insert(
            0,
            VtnEvent::VlanMapChanged {
                path: path.clone(),
                kind: UpdateKind::Removed,
            },
        );
        self.dispatch(events);
        self.persist(&path.bridge.tenant);
        Ok(())
    }

    pub fn vlan_maps(&self, bridge: &NodePath) -> Result<Vec<(NodeVlan, bool)>> {
        let node = self.node(bridge)?;
        let node = node.read();
        Ok(node
            .vlan_maps()
            .map(|vmap| (vmap.key().clone(), vmap.is_registered()))
            .collect())
    }

    // ---- MAC mapping ----

    /// Applies an incremental change to the MAC mapping of a bridge.
    ///
    /// The change is validated as a whole; on error nothing is modified.
    /// A saved mapping still waiting for [`VtnManager::resume`] is dropped
    /// once the change is applied.
    #[instrument(skip(self))]
    pub fn modify_mac_map(&self, bridge: &NodePath, change: &MacMapChange) -> Result<Option<UpdateKind>> {
        let node = self.node(bridge)?;
        let mut events = Vec::new();
        let kind = {
            let mut node = node.write();
            if !node.is_bridge() {
                return Err(VtnError::invalid_config(
                    "MAC mapping",
                    format!("{}: not supported by {}", bridge, node.kind()),
                ));
            }
            let update = self.registry.register_mac_map(bridge, change)?;
            if update.kind.is_some() {
                self.discard_pending_mac_maps(|pending| pending == bridge);
            }
            Self::note_inactivation(&node, &update.inactivated, &mut events);
            node.refresh(self.env(), &mut events);
            update.kind
        };
        let Some(kind) = kind else {
            return Ok(None);
        };
        events.insert(
            0,
            VtnEvent::MacMapChanged {
                path: bridge.clone(),
                kind,
            },
        );
        self.dispatch(events);
        self.persist(&bridge.tenant);
        Ok(Some(kind))
    }

    /// Replaces the MAC mapping of a bridge. `None` removes it.
    pub fn set_mac_map(&self, bridge: &NodePath, config: Option<MacMapConfig>) -> Result<Option<UpdateKind>> {
        self.node(bridge)?;
        let current = self
            .registry
            .mac_map(bridge)
            .map(|mapping| mapping.config())
            .unwrap_or_default();
        let change = MacMapChange::between(&current, &config.unwrap_or_default());
        if change.is_empty() {
            return Ok(None);
        }
        self.modify_mac_map(bridge, &change)
    }

    /// Configured MAC mapping of a bridge, including a saved one that is
    /// not installed yet.
    pub fn mac_map(&self, bridge: &NodePath) -> Result<Option<MacMapConfig>> {
        self.node(bridge)?;
        Ok(self
            .registry
            .mac_map(bridge)
            .map(|mapping| mapping.config())
            .or_else(|| self.pending_mac_map(bridge)))
    }

    /// Hosts currently active in the MAC mapping of a bridge.
    pub fn mac_hosts(&self, bridge: &NodePath) -> Result<Vec<(MacVlan, PhysicalPort)>> {
        self.node(bridge)?;
        Ok(self
            .registry
            .mac_map(bridge)
            .map(|mapping| mapping.activation().active_hosts())
            .unwrap_or_default())
    }

    /// Hosts learned by a bridge.
    pub fn mac_table(&self, bridge: &NodePath) -> Result<Vec<MacTableEntry>> {
        Ok(self.node(bridge)?.read().mac_table().entries())
    }

    /// Forgets one host learned by a bridge. A host the bridge's MAC
    /// mapping activated there is inactivated as well.
    #[instrument(skip(self))]
    pub fn remove_mac_table_entry(&self, bridge: &NodePath, mac: MacAddress) -> Result<Option<MacTableEntry>> {
        let node = self.node(bridge)?;
        let mut events = Vec::new();
        let removed = {
            let mut node = node.write();
            let removed = node.mac_table().remove(mac);
            if let Some(entry) = &removed {
                self.inactivate_learned(&mut node, std::slice::from_ref(entry), &mut events);
            }
            removed
        };
        self.dispatch(events);
        Ok(removed)
    }

    /// Forgets every host learned by a bridge.
    pub fn flush_mac_table(&self, bridge: &NodePath) -> Result<()> {
        self.node(bridge)?.read().mac_table().clear();
        Ok(())
    }

    pub fn faulted_paths(&self, bridge: &NodePath) -> Result<Vec<(NodeId, NodeId)>> {
        Ok(self.node(bridge)?.read().faults().iter().cloned().collect())
    }

    // ---- flow filters ----

    /// Adds or replaces a flow filter rule.
    #[instrument(skip(self))]
    pub fn set_flow_filter(
        &self,
        target: &FilterTarget,
        direction: Direction,
        rule: FilterRule,
    ) -> Result<Option<UpdateKind>> {
        rule.validate()?;
        if let (FilterTarget::Interface(path), FilterKind::Redirect { destination, .. }) = (target, &rule.kind) {
            if destination.path(&path.tenant) == *path {
                return Err(VtnError::invalid_config(
                    "redirect destination",
                    format!("{}: cannot redirect to the interface itself", path),
                ));
            }
        }
        let index = rule.index;
        self.update_filters(target, direction, index, |chain| chain.set(rule))
    }

    #[instrument(skip(self))]
    pub fn remove_flow_filter(
        &self,
        target: &FilterTarget,
        direction: Direction,
        index: u16,
    ) -> Result<Option<UpdateKind>> {
        self.update_filters(target, direction, index, |chain| Ok(chain.remove(index)))
    }

    /// Removes every rule of a chain. Returns true if it was not empty.
    #[instrument(skip(self))]
    pub fn clear_flow_filters(&self, target: &FilterTarget, direction: Direction) -> Result<bool> {
        let cleared = self.with_filters(target, direction, |chain| Ok(chain.clear()))?;
        if cleared {
            debug!("{:?}: {} flow filters cleared", target, direction);
            self.persist(target.tenant());
        }
        Ok(cleared)
    }

    pub fn flow_filters(&self, target: &FilterTarget, direction: Direction) -> Result<Vec<FilterRule>> {
        self.with_filters(target, direction, |chain| Ok(chain.rules().cloned().collect()))
    }

    fn update_filters<F>(
        &self,
        target: &FilterTarget,
        direction: Direction,
        index: u16,
        op: F,
    ) -> Result<Option<UpdateKind>>
    where
        F: FnOnce(&mut FilterChain) -> Result<Option<UpdateKind>>,
    {
        let (owner, kind) = self.with_filters(target, direction, |chain| {
            op(&mut *chain).map(|kind| (chain.owner().to_string(), kind))
        })?;
        if let Some(kind) = kind {
            self.dispatch(vec![VtnEvent::FlowFilterChanged { owner, index, kind }]);
            self.persist(target.tenant());
        }
        Ok(kind)
    }

    fn with_filters<R, F>(&self, target: &FilterTarget, direction: Direction, op: F) -> Result<R>
    where
        F: FnOnce(&mut FilterChain) -> Result<R>,
    {
        match target {
            FilterTarget::Tenant(name) => {
                if direction != Direction::In {
                    return Err(VtnError::invalid_config(
                        "flow-filter",
                        format!("{}: only incoming flow filters are supported", name),
                    ));
                }
                let tenant = self.tenant(name)?;
                let mut chain = tenant.in_filters().write();
                op(&mut *chain)
            }
            FilterTarget::Node(path) => {
                let node = self.node(path)?;
                let mut node = node.write();
                op(node.filters_mut(direction)?)
            }
            FilterTarget::Interface(path) => {
                let node = self.node(&path.node_path())?;
                let mut node = node.write();
                let iface = node
                    .interface_mut(&path.interface)
                    .ok_or_else(|| VtnError::not_found("vInterface", path))?;
                op(iface.filters_mut(direction))
            }
        }
    }

    // ---- path policies ----

    #[instrument(skip(self))]
    pub fn set_path_policy(&self, config: &PathPolicyConfig) -> Result<Option<UpdateKind>> {
        let kind = self.policies.set(config)?;
        if let Some(kind) = kind {
            self.dispatch(vec![VtnEvent::CostPolicyChanged { id: config.id, kind }]);
        }
        Ok(kind)
    }

    #[instrument(skip(self))]
    pub fn remove_path_policy(&self, id: u32) -> Result<Option<UpdateKind>> {
        PathPolicySet::check_id(id)?;
        let kind = self.policies.remove(id);
        if let Some(kind) = kind {
            self.dispatch(vec![VtnEvent::CostPolicyChanged { id, kind }]);
        }
        Ok(kind)
    }

    pub fn path_policy(&self, id: u32) -> Option<PathPolicyConfig> {
        self.policies.get(id).map(|policy| policy.to_config())
    }

    /// Selects the policy used for route resolution, 0 for intrinsic costs.
    #[instrument(skip(self))]
    pub fn select_path_policy(&self, id: u32) -> Result<()> {
        if id > POLICY_ID_MAX {
            return Err(VtnError::invalid_config(
                "path-policy",
                format!("must be in 0-{}: {}", POLICY_ID_MAX, id),
            ));
        }
        *self.path_policy.write() = id;
        Ok(())
    }

    pub fn selected_path_policy(&self) -> u32 {
        *self.path_policy.read()
    }

    // ---- queries ----

    pub fn node_state(&self, path: &NodePath) -> Result<VnodeState> {
        Ok(self.node(path)?.read().state())
    }

    pub fn node_kind(&self, path: &NodePath) -> Result<NodeKind> {
        Ok(self.node(path)?.read().kind())
    }

    pub fn interface_state(&self, path: &InterfacePath) -> Result<VnodeState> {
        let node = self.node(&path.node_path())?;
        let node = node.read();
        node.interface(&path.interface)
            .map(|iface| iface.state())
            .ok_or_else(|| VtnError::not_found("vInterface", path))
    }

    /// Node that would own a packet from `mac` on `port` and `vlan`.
    /// Nothing is activated.
    pub fn classify(&self, port: &PhysicalPort, mac: MacAddress, vlan: VlanId) -> Option<MappedNode> {
        PacketClassifier::new(&self.registry, self.topology.as_ref())
            .lookup(&PortVlan::new(port.clone(), vlan), mac)
    }
}

impl FilterTarget {
    pub fn tenant(&self) -> &str {
        match self {
            Self::Tenant(name) => name,
            Self::Node(path) => &path.tenant,
            Self::Interface(path) => &path.tenant,
        }
    }
}
