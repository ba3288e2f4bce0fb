//! Reactions to changes of the physical network.
//!
//! The topology oracle already reflects the change when these handlers
//! run. Each handler re-resolves port mappings, inactivates MAC-mapped
//! hosts that became unreachable, forgets learned hosts and recomputes the
//! state of every node.

use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, instrument};
use vtn_types::{NodeId, PhysicalPort};

use super::VtnManager;
use crate::event::VtnEvent;
use crate::mapping::PortVlan;
use crate::vnode::{MacTableEntry, VNode};

impl VtnManager {
    /// A port was added, removed, renamed, or changed its link state.
    #[instrument(skip(self))]
    pub fn on_port_changed(&self, port: &PhysicalPort) {
        let mut events = Vec::new();
        let established = self.resolve_port_maps(&mut events);

        let usable = self.topology.is_port_up(port) && self.topology.is_edge_port(port);
        if !usable {
            debug!("{}: port is down or not an edge port", port);
            let inactivations = self.registry.inactivate_ports(|p| p == port);
            self.apply_inactivations(inactivations, &mut events);
        }
        for port_vlan in &established {
            self.take_over_port_vlan(port_vlan, &mut events);
        }
        if !self.topology.is_port_up(port) {
            for node in self.all_nodes() {
                node.read().mac_table().flush_port(port);
            }
        }

        self.refresh_all(&mut events);
        self.dispatch(events);
    }

    /// A switch joined the network.
    #[instrument(skip(self))]
    pub fn on_node_added(&self, node: &NodeId) {
        let mut events = Vec::new();
        let established = self.resolve_port_maps(&mut events);
        for port_vlan in &established {
            self.take_over_port_vlan(port_vlan, &mut events);
        }
        info!("{}: switch added", node);

        self.refresh_all(&mut events);
        self.dispatch(events);
    }

    /// A switch left the network.
    #[instrument(skip(self))]
    pub fn on_node_removed(&self, node: &NodeId) {
        let mut events = Vec::new();
        let inactivations = self.registry.inactivate_ports(|p| p.node == *node);
        self.apply_inactivations(inactivations, &mut events);
        self.resolve_port_maps(&mut events);

        for vnode in self.all_nodes() {
            let mut vnode = vnode.write();
            vnode.mac_table().flush_node(node);
            let path = vnode.path().clone();
            for (source, destination) in vnode.faults_mut().remove_node(node) {
                events.push(VtnEvent::FaultPathRemoved {
                    path: path.clone(),
                    source,
                    destination,
                });
            }
        }
        info!("{}: switch removed", node);

        self.refresh_all(&mut events);
        self.dispatch(events);
    }

    /// Routes were recomputed. Faulted paths that have a route again are
    /// cleared.
    #[instrument(skip(self))]
    pub fn on_route_recalculated(&self) {
        let policy = self.policies.resolve(self.selected_path_policy());
        let mut events = Vec::new();
        for vnode in self.all_nodes() {
            let mut vnode = vnode.write();
            if vnode.faults().is_empty() {
                continue;
            }
            let path = vnode.path().clone();
            let resolved = vnode
                .faults_mut()
                .resolve(|src, dst| self.routes.resolve(src, dst, &policy).is_some());
            for (source, destination) in resolved {
                info!("{}: path {} -> {} resolved", path, source, destination);
                events.push(VtnEvent::FaultPathRemoved {
                    path: path.clone(),
                    source,
                    destination,
                });
            }
            vnode.refresh(self.env(), &mut events);
        }
        self.dispatch(events);
    }

    /// Removes learned hosts not seen within the configured aging
    /// interval. Returns the number of hosts removed.
    pub fn age_mac_tables(&self) -> usize {
        self.expire_mac_entries(self.mac_age)
    }

    /// Removes learned hosts not seen for `max_age` from every bridge.
    /// MAC-mapped hosts among them are inactivated.
    #[instrument(skip(self))]
    pub fn expire_mac_entries(&self, max_age: Duration) -> usize {
        let mut events = Vec::new();
        let mut expired = 0;
        for vnode in self.all_nodes() {
            let mut vnode = vnode.write();
            let aged = vnode.mac_table().age_out(max_age);
            if aged.is_empty() {
                continue;
            }
            debug!("{}: {} learned hosts aged out", vnode.path(), aged.len());
            expired += aged.len();
            self.inactivate_learned(&mut vnode, &aged, &mut events);
        }
        self.dispatch(events);
        expired
    }

    /// Inactivates the MAC-mapped hosts behind removed MAC table entries
    /// of `vnode`, if the mapping has them active where they were learned.
    pub(crate) fn inactivate_learned(&self, vnode: &mut VNode, entries: &[MacTableEntry], events: &mut Vec<VtnEvent>) {
        let Some(mapping) = self.registry.mac_map(vnode.path()) else {
            return;
        };
        let mut changed = false;
        for entry in entries.iter().filter(|entry| entry.interface.is_none()) {
            let learned_here = mapping
                .activation()
                .find(entry.mac)
                .is_some_and(|(host, port)| host.vlan() == entry.port_vlan.vlan && port == entry.port_vlan.port);
            if !learned_here {
                continue;
            }
            let inactivation = self.registry.inactivate_mac(vnode.path(), entry.mac);
            if !inactivation.is_empty() {
                Self::note_inactivation(vnode, &inactivation, events);
                changed = true;
            }
        }
        if changed {
            vnode.refresh(self.env(), events);
        }
    }

    /// Maps every configured port mapping again. Returns the port and VLAN
    /// pairs that became mapped.
    fn resolve_port_maps(&self, events: &mut Vec<VtnEvent>) -> BTreeSet<PortVlan> {
        let mut established = BTreeSet::new();
        for vnode in self.all_nodes() {
            let mut vnode = vnode.write();
            let mut released = Vec::new();
            for iface in vnode.interfaces_mut() {
                let update = iface.resolve_port_map(&self.registry, self.topology.as_ref());
                released.extend(update.released);
                established.extend(update.established);
            }
            for port_vlan in &released {
                vnode.mac_table().flush_port_vlan(port_vlan);
            }
            vnode.refresh(self.env(), events);
        }
        established
    }
}
