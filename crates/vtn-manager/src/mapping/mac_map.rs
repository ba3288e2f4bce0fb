//! MAC mapping: binds a set of hosts to a bridge.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::host::{HostSet, MacVlan};
use super::mac_state::MacMapState;
use crate::state::VnodeState;

/// Allowed and denied hosts of a MAC mapping.
///
/// An allowed host without a MAC address maps every host on its VLAN.
/// Denied hosts always carry a MAC address and win over allowed ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacMapConfig {
    #[serde(default, with = "host_list")]
    allowed: HostSet,
    #[serde(default, with = "host_list")]
    denied: HostSet,
}

impl MacMapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allowed(&self) -> &HostSet {
        &self.allowed
    }

    pub fn denied(&self) -> &HostSet {
        &self.denied
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty() && self.denied.is_empty()
    }

    /// Returns true if `host` is mapped by this configuration.
    pub fn is_mapped(&self, host: &MacVlan) -> bool {
        if host.is_wildcard() || self.denied.contains(host) {
            return false;
        }
        self.allowed.contains(host) || self.allowed.contains(&MacVlan::any(host.vlan()))
    }

    /// Returns the configuration that results from applying `change`.
    pub fn apply(&self, change: &MacMapChange) -> MacMapConfig {
        let mut next = self.clone();
        for host in &change.allow_remove {
            next.allowed.remove(host);
        }
        for host in &change.deny_remove {
            next.denied.remove(host);
        }
        for host in &change.allow_add {
            next.allowed.insert(*host);
        }
        for host in &change.deny_add {
            next.denied.insert(*host);
        }
        next
    }
}

/// Edit of a MAC mapping configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacMapChange {
    pub allow_add: Vec<MacVlan>,
    pub allow_remove: Vec<MacVlan>,
    pub deny_add: Vec<MacVlan>,
    pub deny_remove: Vec<MacVlan>,
}

impl MacMapChange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, host: MacVlan) -> Self {
        self.allow_add.push(host);
        self
    }

    pub fn disallow(mut self, host: MacVlan) -> Self {
        self.allow_remove.push(host);
        self
    }

    pub fn deny(mut self, host: MacVlan) -> Self {
        self.deny_add.push(host);
        self
    }

    pub fn undeny(mut self, host: MacVlan) -> Self {
        self.deny_remove.push(host);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.allow_add.is_empty()
            && self.allow_remove.is_empty()
            && self.deny_add.is_empty()
            && self.deny_remove.is_empty()
    }

    /// Change that turns `from` into `to`.
    pub fn between(from: &MacMapConfig, to: &MacMapConfig) -> Self {
        let diff = |old: &HostSet, new: &HostSet| -> (Vec<MacVlan>, Vec<MacVlan>) {
            let added = new.hosts().filter(|h| !old.contains(h)).copied().collect();
            let removed = old.hosts().filter(|h| !new.contains(h)).copied().collect();
            (added, removed)
        };
        let (allow_add, allow_remove) = diff(&from.allowed, &to.allowed);
        let (deny_add, deny_remove) = diff(&from.denied, &to.denied);
        Self {
            allow_add,
            allow_remove,
            deny_add,
            deny_remove,
        }
    }

    /// Change that installs `config` on an empty mapping.
    pub fn install(config: &MacMapConfig) -> Self {
        Self::between(&MacMapConfig::default(), config)
    }
}

/// A bridge's MAC mapping: configuration plus activation index.
///
/// Shared between the owning bridge and the mapping registry so that
/// packet threads can classify hosts without taking the bridge lock.
#[derive(Debug)]
pub struct MacMapping {
    config: RwLock<MacMapConfig>,
    state: MacMapState,
    /// State derived when the activation index last changed.
    observed: Mutex<VnodeState>,
}

impl Default for MacMapping {
    fn default() -> Self {
        Self {
            config: RwLock::new(MacMapConfig::default()),
            state: MacMapState::new(),
            observed: Mutex::new(VnodeState::Down),
        }
    }
}

impl MacMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> MacMapConfig {
        self.config.read().clone()
    }

    pub fn is_mapped(&self, host: &MacVlan) -> bool {
        self.config.read().is_mapped(host)
    }

    pub fn is_denied(&self, host: &MacVlan) -> bool {
        self.config.read().denied.contains(host)
    }

    pub(crate) fn set_config(&self, config: MacMapConfig) {
        *self.config.write() = config;
    }

    pub fn activation(&self) -> &MacMapState {
        &self.state
    }

    /// Raw state of the mapping as a contributor to its bridge.
    ///
    /// Derived again only when the activation index changed since the last
    /// call.
    pub fn state(&self) -> VnodeState {
        let mut observed = self.observed.lock();
        if self.state.take_dirty() {
            *observed = if self.state.has_active_host() {
                VnodeState::Up
            } else {
                VnodeState::Down
            };
        }
        *observed
    }
}

mod host_list {
    use super::{HostSet, MacVlan};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(set: &HostSet, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(set.hosts())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HostSet, D::Error> {
        Vec::<MacVlan>::deserialize(deserializer).map(|hosts| hosts.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vtn_types::{MacAddress, NodeId, PhysicalPort, VlanId};

    fn host(mac: u64, vlan: u16) -> MacVlan {
        MacVlan::new(MacAddress::from_u64(mac), VlanId::new(vlan).unwrap())
    }

    fn any(vlan: u16) -> MacVlan {
        MacVlan::any(VlanId::new(vlan).unwrap())
    }

    #[test]
    fn test_is_mapped() {
        let config = MacMapConfig::new().apply(
            &MacMapChange::new()
                .allow(host(1, 10))
                .allow(any(20))
                .deny(host(2, 20)),
        );

        assert!(config.is_mapped(&host(1, 10)));
        assert!(!config.is_mapped(&host(1, 11)));
        assert!(config.is_mapped(&host(3, 20)));
        assert!(!config.is_mapped(&host(2, 20)));
        assert!(!config.is_mapped(&any(20)));
    }

    #[test]
    fn test_change_between() {
        let old = MacMapConfig::new().apply(&MacMapChange::new().allow(host(1, 1)).allow(host(2, 1)));
        let new = MacMapConfig::new().apply(&MacMapChange::new().allow(host(2, 1)).deny(host(3, 1)));

        let change = MacMapChange::between(&old, &new);
        assert!(change.allow_add.is_empty());
        assert_eq!(change.allow_remove, vec![host(1, 1)]);
        assert_eq!(change.deny_add, vec![host(3, 1)]);
        assert_eq!(old.apply(&change), new);
        assert!(MacMapChange::between(&new, &new).is_empty());
    }

    #[test]
    fn test_mapping_state() {
        let mapping = MacMapping::new();
        assert_eq!(mapping.state(), VnodeState::Down);

        let port = PhysicalPort::new(NodeId::new("openflow:1").unwrap(), "OF", "1");
        mapping.activation().activate(host(1, 0), &port).unwrap();
        assert_eq!(mapping.state(), VnodeState::Up);
        // The change was observed once; the cached state still holds.
        assert!(!mapping.activation().take_dirty());
        assert_eq!(mapping.state(), VnodeState::Up);

        mapping.activation().activate(host(1, 0), &port).unwrap();
        assert!(!mapping.activation().take_dirty());

        mapping.activation().inactivate_host(&host(1, 0));
        assert_eq!(mapping.state(), VnodeState::Down);
        assert_eq!(mapping.state(), VnodeState::Down);
    }

    #[test]
    fn test_config_serde() {
        let config = MacMapConfig::new().apply(&MacMapChange::new().allow(host(1, 10)).allow(any(5)));
        let json = serde_json::to_string(&config).unwrap();
        let parsed: MacMapConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
