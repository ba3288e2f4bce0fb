//! Virtual interfaces and their port mappings.

use tracing::{debug, warn};

use crate::error::{Result, VtnError};
use crate::event::UpdateKind;
use crate::filter::{Direction, FilterChain};
use crate::mapping::{MappingRegistry, PortMapConfig, PortVlan};
use crate::path::InterfacePath;
use crate::state::VnodeState;
use crate::topology::TopologyOracle;

/// Effect of a port mapping change on the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMapUpdate {
    /// How the configuration changed. `None` for topology-driven updates.
    pub kind: Option<UpdateKind>,
    /// Port and VLAN no longer mapped to the interface.
    pub released: Option<PortVlan>,
    /// Port and VLAN newly mapped to the interface.
    pub established: Option<PortVlan>,
}

impl PortMapUpdate {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.released.is_none() && self.established.is_none()
    }
}

/// A virtual interface of a bridge or terminal.
#[derive(Debug, Clone)]
pub struct VInterface {
    path: InterfacePath,
    enabled: bool,
    description: Option<String>,
    port_map: Option<PortMapConfig>,
    /// Port and VLAN granted by the registry for `port_map`.
    mapped: Option<PortVlan>,
    state: VnodeState,
    in_filters: FilterChain,
    out_filters: FilterChain,
}

impl VInterface {
    pub fn new(path: InterfacePath, enabled: bool, description: Option<String>) -> Self {
        let owner = path.to_string();
        Self {
            in_filters: FilterChain::new(path.tenant.clone(), owner.clone(), Direction::In),
            out_filters: FilterChain::new(path.tenant.clone(), owner, Direction::Out),
            path,
            enabled,
            description,
            port_map: None,
            mapped: None,
            state: VnodeState::Unknown,
        }
    }

    pub fn name(&self) -> &str {
        &self.path.interface
    }

    pub fn path(&self) -> &InterfacePath {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns true if the flag changed.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        let changed = self.enabled != enabled;
        self.enabled = enabled;
        changed
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn set_description(&mut self, description: Option<String>) -> bool {
        let changed = self.description != description;
        self.description = description;
        changed
    }

    pub fn port_map(&self) -> Option<&PortMapConfig> {
        self.port_map.as_ref()
    }

    pub fn mapped(&self) -> Option<&PortVlan> {
        self.mapped.as_ref()
    }

    pub fn state(&self) -> VnodeState {
        self.state
    }

    pub fn filters(&self, direction: Direction) -> &FilterChain {
        match direction {
            Direction::In => &self.in_filters,
            Direction::Out => &self.out_filters,
        }
    }

    pub fn filters_mut(&mut self, direction: Direction) -> &mut FilterChain {
        match direction {
            Direction::In => &mut self.in_filters,
            Direction::Out => &mut self.out_filters,
        }
    }

    /// State of the interface computed from its own configuration.
    pub fn raw_state(&self, topology: &dyn TopologyOracle) -> VnodeState {
        if !self.enabled {
            return VnodeState::Down;
        }
        match (&self.port_map, &self.mapped) {
            (None, _) => VnodeState::Unknown,
            (Some(_), None) => VnodeState::Down,
            (Some(_), Some(pv)) => {
                if topology.is_port_up(&pv.port) && topology.is_edge_port(&pv.port) {
                    VnodeState::Up
                } else {
                    VnodeState::Down
                }
            }
        }
    }

    /// Recomputes the stored state. Returns the new state if it changed.
    pub(crate) fn update_state(&mut self, topology: &dyn TopologyOracle) -> Option<VnodeState> {
        let state = self.raw_state(topology);
        if state == self.state {
            return None;
        }
        debug!("{}: state {} -> {}", self.path, self.state, state);
        self.state = state;
        Some(state)
    }

    /// Replaces the port mapping configuration.
    ///
    /// Fails without changing anything if the resolved port and VLAN are
    /// mapped to another interface.
    pub(crate) fn set_port_map(
        &mut self,
        config: Option<PortMapConfig>,
        registry: &MappingRegistry,
        topology: &dyn TopologyOracle,
    ) -> Result<PortMapUpdate> {
        if let Some(config) = &config {
            config.validate()?;
            if let Some(port) = topology.find_port(&config.node, &config.port) {
                let port_vlan = PortVlan::new(port, config.vlan);
                if let Some(owner) = registry
                    .find_port_map(&port_vlan)
                    .filter(|owner| *owner != self.path)
                {
                    return Err(VtnError::PortMapConflict { port_vlan, owner });
                }
            }
        }

        let kind = match (&self.port_map, &config) {
            (None, None) => None,
            (None, Some(_)) => Some(UpdateKind::Added),
            (Some(_), None) => Some(UpdateKind::Removed),
            (Some(old), Some(new)) if old == new => None,
            (Some(_), Some(_)) => Some(UpdateKind::Changed),
        };
        if kind.is_none() {
            return Ok(PortMapUpdate::default());
        }

        self.port_map = config;
        let mut update = self.resolve_port_map(registry, topology);
        update.kind = kind;
        Ok(update)
    }

    /// Sets the port mapping from saved configuration without touching the
    /// registry. [`VInterface::resolve_port_map`] establishes it later.
    pub(crate) fn restore_port_map(&mut self, config: PortMapConfig) -> Result<()> {
        config.validate()?;
        self.port_map = Some(config);
        Ok(())
    }

    /// Maps the configured port again after a topology change.
    ///
    /// A port and VLAN already owned by another interface leave this one
    /// unmapped.
    pub(crate) fn resolve_port_map(
        &mut self,
        registry: &MappingRegistry,
        topology: &dyn TopologyOracle,
    ) -> PortMapUpdate {
        let wanted = self.port_map.as_ref().and_then(|config| {
            topology
                .find_port(&config.node, &config.port)
                .map(|port| PortVlan::new(port, config.vlan))
        });
        if wanted == self.mapped {
            return PortMapUpdate::default();
        }

        let old = self.mapped.take();
        let mut established = None;
        if let Some(port_vlan) = wanted {
            match registry.register_port_map(&self.path, &port_vlan, old.as_ref()) {
                None => {
                    debug!("{}: mapped to {}", self.path, port_vlan);
                    self.mapped = Some(port_vlan.clone());
                    established = Some(port_vlan);
                }
                Some(owner) => {
                    warn!(
                        "{}: {} is already mapped to {}, port mapping not established",
                        self.path, port_vlan, owner
                    );
                    if let Some(old) = &old {
                        registry.unregister_port_map(&self.path, old);
                    }
                }
            }
        } else if let Some(old) = &old {
            registry.unregister_port_map(&self.path, old);
        }

        PortMapUpdate {
            kind: None,
            released: old,
            established,
        }
    }

    /// Gives the mapped port and VLAN back to the registry.
    pub(crate) fn release_port_map(&mut self, registry: &MappingRegistry) -> Option<PortVlan> {
        let old = self.mapped.take()?;
        registry.unregister_port_map(&self.path, &old);
        Some(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::StaticTopology;
    use pretty_assertions::assert_eq;
    use vtn_types::{NodeId, PhysicalPort, SwitchPort, VlanId};

    fn node() -> NodeId {
        NodeId::new("openflow:1").unwrap()
    }

    fn topology() -> StaticTopology {
        let topology = StaticTopology::new();
        topology.add_port(PhysicalPort::new(node(), "OF", "1"), "eth1", true);
        topology.add_port(PhysicalPort::new(node(), "OF", "2"), "eth2", false);
        topology
    }

    fn port_map(name: &str) -> PortMapConfig {
        PortMapConfig::new(node(), SwitchPort::by_name(name), VlanId::UNTAGGED)
    }

    fn iface(name: &str) -> VInterface {
        VInterface::new(InterfacePath::new("vtn1", "bridge1", name), true, None)
    }

    #[test]
    fn test_leaf_states() {
        let topology = topology();
        let registry = MappingRegistry::new();
        let mut iface = iface("if1");
        assert_eq!(iface.raw_state(&topology), VnodeState::Unknown);

        iface.set_port_map(Some(port_map("eth9")), &registry, &topology).unwrap();
        assert_eq!(iface.raw_state(&topology), VnodeState::Down);

        iface.set_port_map(Some(port_map("eth1")), &registry, &topology).unwrap();
        assert_eq!(iface.raw_state(&topology), VnodeState::Up);

        topology.set_port_up(&PhysicalPort::new(node(), "OF", "1"), false);
        assert_eq!(iface.raw_state(&topology), VnodeState::Down);

        iface.set_port_map(Some(port_map("eth2")), &registry, &topology).unwrap();
        assert_eq!(iface.raw_state(&topology), VnodeState::Down);

        iface.set_port_map(None, &registry, &topology).unwrap();
        iface.set_enabled(false);
        assert_eq!(iface.raw_state(&topology), VnodeState::Down);
    }

    #[test]
    fn test_port_map_exclusive() {
        let topology = topology();
        let registry = MappingRegistry::new();
        let mut if1 = iface("if1");
        let mut if2 = iface("if2");

        let update = if1.set_port_map(Some(port_map("eth1")), &registry, &topology).unwrap();
        assert_eq!(update.kind, Some(UpdateKind::Added));
        let mapped = update.established.unwrap();

        let err = if2
            .set_port_map(Some(port_map("eth1")), &registry, &topology)
            .unwrap_err();
        assert_eq!(
            err,
            VtnError::PortMapConflict {
                port_vlan: mapped.clone(),
                owner: if1.path().clone(),
            }
        );
        assert!(if2.port_map().is_none());

        let update = if1.set_port_map(None, &registry, &topology).unwrap();
        assert_eq!(update.released, Some(mapped));
        assert!(if2.set_port_map(Some(port_map("eth1")), &registry, &topology).is_ok());
    }

    #[test]
    fn test_resolve_follows_topology() {
        let topology = StaticTopology::new();
        let registry = MappingRegistry::new();
        let mut if1 = iface("if1");
        if1.set_port_map(Some(port_map("eth1")), &registry, &topology).unwrap();
        assert!(if1.mapped().is_none());

        topology.add_port(PhysicalPort::new(node(), "OF", "1"), "eth1", true);
        let update = if1.resolve_port_map(&registry, &topology);
        assert!(update.established.is_some());
        assert!(if1.resolve_port_map(&registry, &topology).is_empty());

        topology.remove_port(&PhysicalPort::new(node(), "OF", "1"));
        let update = if1.resolve_port_map(&registry, &topology);
        assert!(update.released.is_some());
        assert!(if1.mapped().is_none());
        let released = PortVlan::new(PhysicalPort::new(node(), "OF", "1"), VlanId::UNTAGGED);
        assert_eq!(registry.find_port_map(&released), None);
    }
}
