//! Restoring saved tenants and taking configuration snapshots.
//!
//! `load_tenant` rebuilds the tree from a [`TenantConfig`] without claiming
//! anything in the registry. `resume` then claims port, VLAN and MAC
//! mappings of every node. Conflicts found there are logged and leave the
//! mapping inactive; nothing is reported to listeners.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{Tenant, VtnManager};
use crate::config::{TenantConfig, VInterfaceConfig, VNodeConfig};
use crate::error::{Result, VtnError};
use crate::filter::{Direction, FilterChain, FilterRule};
use crate::mapping::MacMapChange;
use crate::path::NodePath;
use crate::vnode::{VInterface, VNode};

fn load_rules(chain: &mut FilterChain, rules: &[FilterRule]) -> Result<()> {
    for rule in rules {
        chain.set(rule.clone())?;
    }
    Ok(())
}

fn build_node(tenant: &str, config: &VNodeConfig, mac_table_limit: usize) -> Result<VNode> {
    let path = NodePath::new(tenant, config.name.clone());
    let mut node = VNode::new(path.clone(), config.kind, config.description.clone())
        .with_mac_table_limit(mac_table_limit);
    for iface_config in &config.interfaces {
        let mut iface = VInterface::new(
            path.interface(iface_config.name.clone()),
            iface_config.enabled,
            iface_config.description.clone(),
        );
        if let Some(port_map) = &iface_config.port_map {
            iface.restore_port_map(port_map.clone())?;
        }
        load_rules(iface.filters_mut(Direction::In), &iface_config.in_filters)?;
        load_rules(iface.filters_mut(Direction::Out), &iface_config.out_filters)?;
        node.add_interface(iface)?;
    }
    for key in &config.vlan_maps {
        node.restore_vlan_map(key.clone())?;
    }
    if !config.in_filters.is_empty() {
        load_rules(node.filters_mut(Direction::In)?, &config.in_filters)?;
    }
    if !config.out_filters.is_empty() {
        load_rules(node.filters_mut(Direction::Out)?, &config.out_filters)?;
    }
    Ok(node)
}

impl VtnManager {
    /// Adds a tenant from saved configuration. Mappings stay inactive until
    /// [`VtnManager::resume`] runs.
    #[instrument(skip(self, config), fields(tenant = %config.name))]
    pub fn load_tenant(&self, config: &TenantConfig) -> Result<()> {
        config.validate()?;
        let tenant = Tenant::new(config.name.clone(), config.description.clone());
        load_rules(&mut tenant.in_filters().write(), &config.in_filters)?;

        let mut mac_maps = Vec::new();
        {
            let mut nodes = tenant.nodes().write();
            for node_config in &config.nodes {
                let node = build_node(&config.name, node_config, self.mac_table_limit)?;
                if let Some(mac_map) = node_config.mac_map.as_ref().filter(|m| !m.is_empty()) {
                    mac_maps.push((node.path().clone(), mac_map.clone()));
                }
                nodes.insert(node_config.name.clone(), Arc::new(RwLock::new(node)));
            }
        }

        {
            let mut tenants = self.tenants.write();
            if tenants.contains_key(&config.name) {
                return Err(VtnError::already_exists("VTN", &config.name));
            }
            tenants.insert(config.name.clone(), Arc::new(tenant));
        }
        self.pending_mac_maps.lock().extend(mac_maps);
        info!("{}: VTN loaded with {} nodes", config.name, config.nodes.len());
        Ok(())
    }

    /// Claims the mappings of every loaded node and derives all states.
    ///
    /// Port and VLAN mappings that are already claimed, and MAC mappings
    /// that conflict, are logged and left inactive. A MAC mapping that
    /// could not be installed stays pending, so calling it again retries
    /// every one of them.
    #[instrument(skip(self))]
    pub fn resume(&self) {
        for node in self.all_nodes() {
            let mut node = node.write();
            for iface in node.interfaces_mut() {
                iface.resolve_port_map(&self.registry, self.topology.as_ref());
            }
            node.register_vlan_maps(&self.registry);
        }

        let pending = std::mem::take(&mut *self.pending_mac_maps.lock());
        let mut retry = BTreeMap::new();
        for (path, config) in pending {
            let Ok(node) = self.node(&path) else {
                warn!("{}: node removed before its MAC mapping was restored", path);
                continue;
            };
            let _node = node.write();
            if let Err(err) = self.registry.register_mac_map(&path, &MacMapChange::install(&config)) {
                warn!("{}: MAC mapping not restored: {}", path, err);
                retry.insert(path, config);
            }
        }
        if !retry.is_empty() {
            info!("{} MAC mappings left pending", retry.len());
            self.pending_mac_maps.lock().extend(retry);
        }

        let mut events = Vec::new();
        self.refresh_all(&mut events);
        info!("VTN resumed: {} state changes", events.len());
    }

    /// Current configuration of a tenant.
    pub fn snapshot(&self, name: &str) -> Result<TenantConfig> {
        let tenant = self.tenant(name)?;
        let mut config = TenantConfig::new(name);
        config.description = tenant.description();
        config.in_filters = tenant.in_filters().read().rules().cloned().collect();

        for node in tenant.node_refs() {
            let node = node.read();
            let mut node_config = VNodeConfig::new(node.name(), node.kind());
            node_config.description = node.description().map(str::to_string);
            node_config.interfaces = node
                .interfaces()
                .map(|iface| VInterfaceConfig {
                    name: iface.name().to_string(),
                    enabled: iface.is_enabled(),
                    description: iface.description().map(str::to_string),
                    port_map: iface.port_map().cloned(),
                    in_filters: iface.filters(Direction::In).rules().cloned().collect(),
                    out_filters: iface.filters(Direction::Out).rules().cloned().collect(),
                })
                .collect();
            node_config.vlan_maps = node.vlan_maps().map(|vmap| vmap.key().clone()).collect();
            node_config.mac_map = self
                .registry
                .mac_map(node.path())
                .map(|m| m.config())
                .or_else(|| self.pending_mac_map(node.path()));
            node_config.in_filters = node.filters(Direction::In).rules().cloned().collect();
            node_config.out_filters = node.filters(Direction::Out).rules().cloned().collect();
            config.nodes.push(node_config);
        }
        Ok(config)
    }
}
