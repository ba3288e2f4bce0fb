//! Host keys and the ordered host binding used by MAC mapping.
//!
//! A [`MacVlan`] orders by MAC address first and VLAN second, so every
//! binding for one MAC address is contiguous in a [`HostBinding`]. The
//! greatest key not above `(mac, VlanId::MAX)` is therefore the only
//! candidate for "is this MAC bound at any VLAN", which is how duplicate
//! MAC addresses are detected without caring about the VLAN.

use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;
use vtn_types::{MacAddress, VlanId};

/// A host identified by MAC address and VLAN.
///
/// The MAC address may be undefined; such a key stands for every host on
/// the VLAN and is only valid in the allowed-host set of a MAC mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacVlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mac: Option<MacAddress>,
    vlan: VlanId,
}

impl MacVlan {
    /// A concrete host.
    pub const fn new(mac: MacAddress, vlan: VlanId) -> Self {
        Self {
            mac: Some(mac),
            vlan,
        }
    }

    /// Every host on `vlan`.
    pub const fn any(vlan: VlanId) -> Self {
        Self { mac: None, vlan }
    }

    pub const fn mac(&self) -> Option<MacAddress> {
        self.mac
    }

    pub const fn vlan(&self) -> VlanId {
        self.vlan
    }

    /// Returns true if the MAC address is undefined.
    pub const fn is_wildcard(&self) -> bool {
        self.mac.is_none()
    }

    /// The greatest key that can hold `mac`, used as the floor query bound.
    const fn ceiling(mac: MacAddress) -> Self {
        Self {
            mac: Some(mac),
            vlan: VlanId::HIGHEST,
        }
    }
}

impl fmt::Display for MacVlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mac {
            Some(mac) => write!(f, "{}@{}", mac, self.vlan),
            None => write!(f, "*@{}", self.vlan),
        }
    }
}

/// Ordered map from hosts to values with MAC lookup that ignores VLAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBinding<V = ()> {
    hosts: BTreeMap<MacVlan, V>,
}

/// Host set keyed the same way as [`HostBinding`].
pub type HostSet = HostBinding<()>;

impl<V> HostBinding<V> {
    pub fn new() -> Self {
        Self {
            hosts: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn contains(&self, host: &MacVlan) -> bool {
        self.hosts.contains_key(host)
    }

    pub fn get(&self, host: &MacVlan) -> Option<&V> {
        self.hosts.get(host)
    }

    /// Binds `host`, returning the previous value.
    pub fn bind(&mut self, host: MacVlan, value: V) -> Option<V> {
        self.hosts.insert(host, value)
    }

    pub fn unbind(&mut self, host: &MacVlan) -> Option<V> {
        self.hosts.remove(host)
    }

    /// Finds the binding of `mac` at any VLAN.
    ///
    /// This is a floor query: the greatest key not above `(mac, 4095)`
    /// either carries `mac` or `mac` is not bound at all.
    pub fn find_mac(&self, mac: MacAddress) -> Option<(&MacVlan, &V)> {
        self.hosts
            .range(..=MacVlan::ceiling(mac))
            .next_back()
            .filter(|(host, _)| host.mac == Some(mac))
    }

    /// Returns the binding of `host`'s MAC address at another VLAN, if any.
    pub fn conflicting(&self, host: &MacVlan) -> Option<MacVlan> {
        let mac = host.mac?;
        self.find_mac(mac)
            .map(|(found, _)| *found)
            .filter(|found| found.vlan != host.vlan)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, MacVlan, V> {
        self.hosts.iter()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &MacVlan> {
        self.hosts.keys()
    }
}

impl HostSet {
    /// Adds `host` to the set. Returns false if it was already present.
    pub fn insert(&mut self, host: MacVlan) -> bool {
        self.hosts.insert(host, ()).is_none()
    }

    pub fn remove(&mut self, host: &MacVlan) -> bool {
        self.hosts.remove(host).is_some()
    }
}

impl<V> Default for HostBinding<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<MacVlan> for HostSet {
    fn from_iter<I: IntoIterator<Item = MacVlan>>(iter: I) -> Self {
        Self {
            hosts: iter.into_iter().map(|host| (host, ())).collect(),
        }
    }
}
