//! Exclusive ownership of physical networks by virtual nodes.
//!
//! The registry is the only structure shared across bridges. Every map is a
//! `DashMap`, so registering unrelated keys never contends on one lock.
//!
//! | map            | key        | owner                          |
//! |----------------|------------|--------------------------------|
//! | `port_maps`    | `PortVlan` | interface with a port mapping  |
//! | `vlan_maps`    | `NodeVlan` | VLAN mapping of a bridge       |
//! | `mac_hosts`    | `MacVlan`  | bridge whose MAC mapping allows the host |
//! | `active_macs`  | MAC        | bridge where the MAC is active |
//!
//! `active_macs` spans every bridge, so a MAC address can be active in at
//! most one MAC mapping at a time.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use vtn_types::{MacAddress, NodeId, PhysicalPort, VlanId};

use super::host::MacVlan;
use super::mac_map::{MacMapChange, MacMapConfig, MacMapping};
use super::mac_state::{Activation, Inactivation};
use super::port_map::PortVlan;
use super::vlan_map::NodeVlan;
use crate::error::{Result, VtnError};
use crate::event::UpdateKind;
use crate::path::{InterfacePath, NodePath, VlanMapPath};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveMac {
    vlan: VlanId,
    owner: NodePath,
}

/// Result of a MAC mapping reconfiguration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacMapUpdate {
    /// How the mapping changed, `None` if nothing changed.
    pub kind: Option<UpdateKind>,
    /// Hosts that are no longer mapped after the change.
    pub inactivated: Inactivation,
}

/// Registry of port, VLAN and MAC mappings.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    port_maps: DashMap<PortVlan, InterfacePath>,
    vlan_maps: DashMap<NodeVlan, VlanMapPath>,
    mac_hosts: DashMap<MacVlan, NodePath>,
    active_macs: DashMap<MacAddress, ActiveMac>,
    mac_maps: DashMap<NodePath, Arc<MacMapping>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- port mapping ----

    /// Claims `port_vlan` for `owner` and releases `old`.
    ///
    /// Returns the current owner if `port_vlan` belongs to another
    /// interface; nothing is changed in that case.
    pub fn register_port_map(
        &self,
        owner: &InterfacePath,
        port_vlan: &PortVlan,
        old: Option<&PortVlan>,
    ) -> Option<InterfacePath> {
        match self.port_maps.entry(port_vlan.clone()) {
            Entry::Occupied(entry) => {
                if entry.get() != owner {
                    return Some(entry.get().clone());
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(owner.clone());
                debug!("{}: port mapping registered on {}", owner, port_vlan);
            }
        }

        if let Some(old) = old.filter(|old| *old != port_vlan) {
            self.unregister_port_map(owner, old);
        }
        None
    }

    /// Releases `port_vlan` if it is owned by `owner`.
    pub fn unregister_port_map(&self, owner: &InterfacePath, port_vlan: &PortVlan) -> bool {
        let removed = self
            .port_maps
            .remove_if(port_vlan, |_, current| current == owner)
            .is_some();
        if removed {
            debug!("{}: port mapping released on {}", owner, port_vlan);
        }
        removed
    }

    pub fn find_port_map(&self, port_vlan: &PortVlan) -> Option<InterfacePath> {
        self.port_maps.get(port_vlan).map(|owner| owner.clone())
    }

    pub fn is_port_mapped(&self, port_vlan: &PortVlan) -> bool {
        self.port_maps.contains_key(port_vlan)
    }

    // ---- VLAN mapping ----

    /// Claims `key` for `owner`. Returns the current owner on conflict.
    pub fn register_vlan_map(&self, owner: &VlanMapPath, key: &NodeVlan) -> Option<VlanMapPath> {
        match self.vlan_maps.entry(key.clone()) {
            Entry::Occupied(entry) => {
                if entry.get() != owner {
                    return Some(entry.get().clone());
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(owner.clone());
                debug!("{}: VLAN mapping registered", owner);
            }
        }
        None
    }

    pub fn unregister_vlan_map(&self, owner: &VlanMapPath, key: &NodeVlan) -> bool {
        self.vlan_maps
            .remove_if(key, |_, current| current == owner)
            .is_some()
    }

    /// Finds the VLAN mapping for `vlan` on `node`, preferring a mapping
    /// for that node over the one for every node.
    pub fn find_vlan_map(&self, node: &NodeId, vlan: VlanId) -> Option<VlanMapPath> {
        self.vlan_maps
            .get(&NodeVlan::new(Some(node.clone()), vlan))
            .or_else(|| self.vlan_maps.get(&NodeVlan::new(None, vlan)))
            .map(|owner| owner.clone())
    }

    // ---- MAC mapping ----

    /// Returns the MAC mapping owned by `owner`.
    pub fn mac_map(&self, owner: &NodePath) -> Option<Arc<MacMapping>> {
        self.mac_maps.get(owner).map(|mapping| Arc::clone(&mapping))
    }

    /// Finds the bridge whose MAC mapping allows `host`.
    ///
    /// An exact host entry takes precedence over a VLAN wildcard.
    pub fn find_mac_owner(&self, host: &MacVlan) -> Option<NodePath> {
        self.mac_hosts
            .get(host)
            .or_else(|| self.mac_hosts.get(&MacVlan::any(host.vlan())))
            .map(|owner| owner.clone())
    }

    /// Applies `change` to the MAC mapping of `owner`.
    ///
    /// The change is validated as a whole before anything is modified.
    /// Added hosts are claimed one by one; if another bridge holds one of
    /// them, the claims taken so far are released and nothing changes.
    /// Hosts that are no longer mapped are inactivated and reported.
    ///
    /// Changes to one owner must be serialized by the caller.
    pub fn register_mac_map(&self, owner: &NodePath, change: &MacMapChange) -> Result<MacMapUpdate> {
        if let Some(host) = change.deny_add.iter().find(|host| host.is_wildcard()) {
            return Err(VtnError::invalid_config(
                "denied-hosts",
                format!("MAC address must be specified: {}", host),
            ));
        }

        let mapping = self.mac_map(owner);
        let current = mapping.as_ref().map(|m| m.config()).unwrap_or_default();
        let next = current.apply(change);
        if next == current {
            return Ok(MacMapUpdate::default());
        }

        let added: Vec<MacVlan> = change
            .allow_add
            .iter()
            .filter(|host| !current.allowed().contains(host))
            .copied()
            .collect();
        self.check_allowed(owner, &next, &added)?;
        let claimed = self.claim_hosts(owner, &added)?;
        if let Err(err) = self.check_active(owner, &added) {
            self.release_hosts(owner, &claimed);
            return Err(err);
        }

        let mapping = mapping.unwrap_or_else(|| {
            let created = Arc::new(MacMapping::new());
            self.mac_maps.insert(owner.clone(), Arc::clone(&created));
            created
        });
        let dropped: Vec<MacVlan> = change
            .allow_remove
            .iter()
            .filter(|host| !next.allowed().contains(host))
            .copied()
            .collect();
        self.release_hosts(owner, &dropped);

        let removed = next.is_empty();
        mapping.set_config(next);
        let mut inactivated = if removed {
            self.mac_maps.remove(owner);
            mapping.activation().clear()
        } else {
            let config = mapping.config();
            mapping
                .activation()
                .inactivate_unmapped(|host| config.is_mapped(host))
        };
        self.release_active(owner, (!removed).then_some(&*mapping), &mut inactivated);

        let kind = if current.is_empty() {
            UpdateKind::Added
        } else if removed {
            UpdateKind::Removed
        } else {
            UpdateKind::Changed
        };
        debug!("{}: MAC mapping {:?}", owner, kind);
        Ok(MacMapUpdate {
            kind: Some(kind),
            inactivated,
        })
    }

    /// Checks added hosts against the new configuration itself.
    fn check_allowed(&self, owner: &NodePath, next: &MacMapConfig, added: &[MacVlan]) -> Result<()> {
        for host in added {
            if let Some(existing) = next.allowed().conflicting(host) {
                return Err(VtnError::DuplicateMac {
                    host: *host,
                    existing,
                });
            }
        }
        self.check_active(owner, added)
    }

    /// Fails if the MAC address of an added host is active in another
    /// bridge.
    fn check_active(&self, owner: &NodePath, added: &[MacVlan]) -> Result<()> {
        for mac in added.iter().filter_map(|host| host.mac()) {
            if let Some(active) = self.active_macs.get(&mac).filter(|a| a.owner != *owner) {
                return Err(VtnError::MacMapConflict {
                    host: MacVlan::new(mac, active.vlan),
                    owner: active.owner.clone(),
                });
            }
        }
        Ok(())
    }

    /// Claims every host in `hosts` for `owner`. Returns the hosts that
    /// were not claimed before. On conflict every new claim is released.
    fn claim_hosts(&self, owner: &NodePath, hosts: &[MacVlan]) -> Result<Vec<MacVlan>> {
        let mut claimed = Vec::with_capacity(hosts.len());
        for host in hosts {
            match self.mac_hosts.entry(*host) {
                Entry::Occupied(entry) if entry.get() != owner => {
                    let other = entry.get().clone();
                    drop(entry);
                    self.release_hosts(owner, &claimed);
                    return Err(VtnError::MacMapConflict { host: *host, owner: other });
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(entry) => {
                    entry.insert(owner.clone());
                    claimed.push(*host);
                }
            }
        }
        Ok(claimed)
    }

    fn release_hosts(&self, owner: &NodePath, hosts: &[MacVlan]) {
        for host in hosts {
            self.mac_hosts.remove_if(host, |_, claimed| claimed == owner);
        }
    }

    /// Removes the MAC mapping of `owner` and inactivates all its hosts.
    pub fn unregister_mac_map(&self, owner: &NodePath) -> Inactivation {
        let Some((_, mapping)) = self.mac_maps.remove(owner) else {
            return Inactivation::default();
        };
        let allowed: Vec<MacVlan> = mapping.config().allowed().hosts().copied().collect();
        self.release_hosts(owner, &allowed);
        mapping.set_config(MacMapConfig::default());
        let mut inactivated = mapping.activation().clear();
        self.release_active(owner, None, &mut inactivated);
        inactivated
    }

    /// Records that `host` was seen on `port` and is mapped by `owner`.
    ///
    /// Fails with `DuplicateMac` if the MAC address is active on another
    /// VLAN in any bridge.
    pub fn activate_mac_map(
        &self,
        owner: &NodePath,
        host: MacVlan,
        port: &PhysicalPort,
    ) -> Result<Activation> {
        let mac = host
            .mac()
            .ok_or_else(|| VtnError::invalid_config("host", "MAC address is required"))?;
        let mapping = self
            .mac_map(owner)
            .ok_or_else(|| VtnError::not_found("MAC mapping", owner))?;

        match self.active_macs.entry(mac) {
            Entry::Occupied(entry) => {
                let active = entry.get();
                if active.vlan != host.vlan() {
                    return Err(VtnError::DuplicateMac {
                        host,
                        existing: MacVlan::new(mac, active.vlan),
                    });
                }
                if active.owner != *owner {
                    return Err(VtnError::MacMapConflict {
                        host,
                        owner: active.owner.clone(),
                    });
                }
                mapping.activation().activate(host, port)
            }
            Entry::Vacant(entry) => {
                let activation = mapping.activation().activate(host, port)?;
                entry.insert(ActiveMac {
                    vlan: host.vlan(),
                    owner: owner.clone(),
                });
                Ok(activation)
            }
        }
    }

    /// Runs an inactivation on the MAC mapping of `owner` and releases the
    /// inactivated MAC addresses from the global index.
    pub fn inactivate_mac_map<F>(&self, owner: &NodePath, op: F) -> Inactivation
    where
        F: FnOnce(&MacMapping) -> Inactivation,
    {
        let Some(mapping) = self.mac_map(owner) else {
            return Inactivation::default();
        };
        let mut inactivated = op(&mapping);
        self.release_active(owner, Some(&mapping), &mut inactivated);
        inactivated
    }

    /// Inactivates the host of `owner` that has `mac` active.
    ///
    /// The host is removed from the activation index and from the global
    /// index in one step, so a concurrent activation either completes
    /// before it or sees the MAC address free.
    pub fn inactivate_mac(&self, owner: &NodePath, mac: MacAddress) -> Inactivation {
        let Some(mapping) = self.mac_map(owner) else {
            return Inactivation::default();
        };
        match self.active_macs.entry(mac) {
            Entry::Occupied(entry) if entry.get().owner == *owner => {
                let host = MacVlan::new(mac, entry.get().vlan);
                let inactivated = mapping.activation().inactivate_host(&host);
                entry.remove();
                inactivated
            }
            _ => Inactivation::default(),
        }
    }

    /// Inactivates hosts mapped on `port_vlan` in every MAC mapping.
    ///
    /// Used when a port mapping takes the port and VLAN over.
    pub fn inactivate_port_vlan(&self, port_vlan: &PortVlan) -> Vec<(NodePath, Inactivation)> {
        let owners: Vec<NodePath> = self.mac_maps.iter().map(|e| e.key().clone()).collect();
        owners
            .into_iter()
            .filter_map(|owner| {
                let result =
                    self.inactivate_mac_map(&owner, |m| m.activation().inactivate_port_vlan(port_vlan));
                (!result.is_empty()).then_some((owner, result))
            })
            .collect()
    }

    /// Inactivates hosts seen on ports selected by `filter` in every MAC
    /// mapping. Used when a switch or port goes away.
    pub fn inactivate_ports<F>(&self, filter: F) -> Vec<(NodePath, Inactivation)>
    where
        F: Fn(&PhysicalPort) -> bool,
    {
        let owners: Vec<NodePath> = self.mac_maps.iter().map(|e| e.key().clone()).collect();
        owners
            .into_iter()
            .filter_map(|owner| {
                let result = self.inactivate_mac_map(&owner, |m| m.activation().inactivate_ports(&filter));
                (!result.is_empty()).then_some((owner, result))
            })
            .collect()
    }

    /// Returns the bridge where `mac` is active and the VLAN it is active on.
    pub fn active_mac_owner(&self, mac: MacAddress) -> Option<(NodePath, VlanId)> {
        self.active_macs
            .get(&mac)
            .map(|active| (active.owner.clone(), active.vlan))
    }

    /// Removes inactivated MAC addresses from the global index.
    ///
    /// A host of `mapping` activated again since the inactivation keeps
    /// its entry and is dropped from `inactivated`. The check runs while
    /// the entry is held, which is also held by `activate_mac_map`.
    fn release_active(&self, owner: &NodePath, mapping: Option<&MacMapping>, inactivated: &mut Inactivation) {
        inactivated.hosts.retain(|(host, port)| {
            let Some(mac) = host.mac() else { return true };
            match self.active_macs.entry(mac) {
                Entry::Occupied(entry) if entry.get().owner == *owner && entry.get().vlan == host.vlan() => {
                    if mapping.is_some_and(|m| m.activation().is_active(host)) {
                        debug!("{}: {} activated again on {}", owner, host, port);
                        return false;
                    }
                    entry.remove();
                }
                _ => warn!("{}: {} on {} was not in the active MAC index", owner, host, port),
            }
            true
        });
    }

    /// Removes every claim held by nodes of `tenant`.
    pub fn purge_tenant(&self, tenant: &str) {
        self.port_maps.retain(|_, owner| owner.tenant != tenant);
        self.vlan_maps.retain(|_, owner| owner.bridge.tenant != tenant);
        self.mac_hosts.retain(|_, owner| owner.tenant != tenant);
        self.active_macs.retain(|_, active| active.owner.tenant != tenant);
        self.mac_maps.retain(|owner, _| owner.tenant != tenant);
    }
}
