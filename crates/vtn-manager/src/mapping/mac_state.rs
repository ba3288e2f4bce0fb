//! Runtime activation index of a MAC mapping.
//!
//! `MacMapState` records which allowed hosts have actually been seen on the
//! network and where. It is synchronized on its own mutex, independent of
//! the bridge lock, because activations arrive from packet threads while
//! reconfiguration runs on administrative threads.
//!
//! Two indices are kept in lockstep:
//!
//! ```text
//! active_hosts : MacVlan  -> PhysicalPort        (ordered, floor query by MAC)
//! mapped_ports : PortVlan -> {MacVlan, ...}      (reverse index, never empty)
//! ```

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use vtn_types::{MacAddress, PhysicalPort};

use super::host::{HostBinding, MacVlan};
use super::port_map::PortVlan;
use crate::error::{Result, VtnError};

/// Outcome of a successful activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activation {
    /// The mapping had no active host before this one.
    pub first: bool,
    /// The binding was created or moved to another port.
    pub changed: bool,
    /// Port and VLAN that lost their last host because the host moved.
    pub released: Option<PortVlan>,
}

/// Hosts removed from the activation index by one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inactivation {
    /// Hosts that are no longer mapped, with the port they were seen on.
    pub hosts: Vec<(MacVlan, PhysicalPort)>,
    /// Ports and VLANs whose last host was removed.
    pub released: Vec<PortVlan>,
}

impl Inactivation {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[derive(Debug, Default)]
struct Inner {
    active_hosts: HostBinding<PhysicalPort>,
    mapped_ports: HashMap<PortVlan, BTreeSet<MacVlan>>,
    dirty: bool,
}

impl Inner {
    /// Drops `host` from both indices.
    fn unbind(&mut self, host: &MacVlan) -> Option<(PhysicalPort, Option<PortVlan>)> {
        let port = self.active_hosts.unbind(host)?;
        let pv = PortVlan::new(port.clone(), host.vlan());
        let released = self.unlink(&pv, host).then_some(pv);
        Some((port, released))
    }

    /// Removes `host` from the reverse index. Returns true if `pv` became empty.
    fn unlink(&mut self, pv: &PortVlan, host: &MacVlan) -> bool {
        match self.mapped_ports.get_mut(pv) {
            Some(hosts) => {
                hosts.remove(host);
                if hosts.is_empty() {
                    self.mapped_ports.remove(pv);
                    true
                } else {
                    false
                }
            }
            None => {
                tracing::error!("{}: host {} missing from reverse index", pv, host);
                false
            }
        }
    }

    fn unbind_all(&mut self, hosts: Vec<MacVlan>) -> Inactivation {
        let mut result = Inactivation::default();
        for host in hosts {
            if let Some((port, released)) = self.unbind(&host) {
                result.hosts.push((host, port));
                result.released.extend(released);
            }
        }
        if !result.is_empty() {
            self.dirty = true;
        }
        result
    }
}

/// Activation index of one MAC mapping.
#[derive(Debug, Default)]
pub struct MacMapState {
    inner: Mutex<Inner>,
}

impl MacMapState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `host` was seen on `port`.
    ///
    /// A host already active on another port is moved there. A MAC address
    /// already active on another VLAN is rejected and the existing binding
    /// is left untouched.
    pub fn activate(&self, host: MacVlan, port: &PhysicalPort) -> Result<Activation> {
        let mac = host
            .mac()
            .ok_or_else(|| VtnError::invalid_config("host", "MAC address is required"))?;

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.active_hosts.conflicting(&host) {
            return Err(VtnError::DuplicateMac { host, existing });
        }

        let first = inner.active_hosts.is_empty();
        let mut released = None;
        if let Some(old) = inner.active_hosts.bind(host, port.clone()) {
            if old == *port {
                return Ok(Activation::default());
            }
            let old_pv = PortVlan::new(old, host.vlan());
            if inner.unlink(&old_pv, &host) {
                released = Some(old_pv);
            }
        }

        let pv = PortVlan::new(port.clone(), host.vlan());
        inner.mapped_ports.entry(pv).or_default().insert(host);
        inner.dirty = true;

        tracing::debug!("{}: host activated on {}", MacVlan::new(mac, host.vlan()), port);
        Ok(Activation {
            first,
            changed: true,
            released,
        })
    }

    /// Inactivates one host.
    pub fn inactivate_host(&self, host: &MacVlan) -> Inactivation {
        self.inner.lock().unbind_all(vec![*host])
    }

    /// Inactivates every host mapped on `pv`.
    pub fn inactivate_port_vlan(&self, pv: &PortVlan) -> Inactivation {
        let mut inner = self.inner.lock();
        let hosts: Vec<MacVlan> = inner
            .mapped_ports
            .get(pv)
            .map(|hosts| hosts.iter().copied().collect())
            .unwrap_or_default();
        inner.unbind_all(hosts)
    }

    /// Inactivates every host seen on a port selected by `filter`.
    pub fn inactivate_ports<F>(&self, filter: F) -> Inactivation
    where
        F: Fn(&PhysicalPort) -> bool,
    {
        let mut inner = self.inner.lock();
        let hosts: Vec<MacVlan> = inner
            .mapped_ports
            .iter()
            .filter(|(pv, _)| filter(&pv.port))
            .flat_map(|(_, hosts)| hosts.iter().copied())
            .collect();
        inner.unbind_all(hosts)
    }

    /// Inactivates every host for which `mapped` returns false.
    pub fn inactivate_unmapped<F>(&self, mapped: F) -> Inactivation
    where
        F: Fn(&MacVlan) -> bool,
    {
        let mut inner = self.inner.lock();
        let hosts: Vec<MacVlan> = inner
            .active_hosts
            .hosts()
            .filter(|host| !mapped(host))
            .copied()
            .collect();
        inner.unbind_all(hosts)
    }

    /// Inactivates every host.
    pub fn clear(&self) -> Inactivation {
        self.inactivate_unmapped(|_| false)
    }

    /// Returns the host that owns `mac` and the port it was seen on.
    pub fn find(&self, mac: MacAddress) -> Option<(MacVlan, PhysicalPort)> {
        self.inner
            .lock()
            .active_hosts
            .find_mac(mac)
            .map(|(host, port)| (*host, port.clone()))
    }

    pub fn is_active(&self, host: &MacVlan) -> bool {
        self.inner.lock().active_hosts.contains(host)
    }

    pub fn has_active_host(&self) -> bool {
        !self.inner.lock().active_hosts.is_empty()
    }

    pub fn active_hosts(&self) -> Vec<(MacVlan, PhysicalPort)> {
        self.inner
            .lock()
            .active_hosts
            .iter()
            .map(|(host, port)| (*host, port.clone()))
            .collect()
    }

    /// Ports and VLANs that carry at least one active host.
    pub fn mapped_ports(&self) -> Vec<PortVlan> {
        let mut ports: Vec<PortVlan> = self.inner.lock().mapped_ports.keys().cloned().collect();
        ports.sort();
        ports
    }

    /// Returns true if `pv` carries at least one active host.
    pub fn is_mapped(&self, pv: &PortVlan) -> bool {
        self.inner.lock().mapped_ports.contains_key(pv)
    }

    /// Returns whether the index changed since the last call, and resets it.
    pub fn take_dirty(&self) -> bool {
        std::mem::take(&mut self.inner.lock().dirty)
    }

    /// Checks that the two indices describe the same bindings.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let inner = self.inner.lock();
        let mut reverse: Vec<(MacVlan, PhysicalPort)> = inner
            .mapped_ports
            .iter()
            .flat_map(|(pv, hosts)| {
                assert!(!hosts.is_empty(), "empty reverse index entry for {}", pv);
                hosts.iter().map(move |host| (*host, pv.port.clone()))
            })
            .collect();
        reverse.sort();
        let forward: Vec<(MacVlan, PhysicalPort)> = inner
            .active_hosts
            .iter()
            .map(|(host, port)| (*host, port.clone()))
            .collect();
        forward == reverse
            && inner
                .mapped_ports
                .iter()
                .all(|(pv, hosts)| hosts.iter().all(|host| host.vlan() == pv.vlan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vtn_types::{NodeId, VlanId};

    fn mac(value: u64) -> MacAddress {
        MacAddress::from_u64(value)
    }

    fn vlan(id: u16) -> VlanId {
        VlanId::new(id).unwrap()
    }

    fn port(node: &str, id: &str) -> PhysicalPort {
        PhysicalPort::new(NodeId::new(node).unwrap(), "OF", id)
    }

    #[test]
    fn test_first_activation() {
        let state = MacMapState::new();
        let host = MacVlan::new(mac(1), vlan(10));

        let act = state.activate(host, &port("openflow:1", "1")).unwrap();
        assert!(act.first);
        assert!(act.changed);
        assert!(state.take_dirty());
        assert!(!state.take_dirty());

        let again = state.activate(host, &port("openflow:1", "1")).unwrap();
        assert_eq!(again, Activation::default());
        assert!(!state.take_dirty());

        let second = state
            .activate(MacVlan::new(mac(2), vlan(10)), &port("openflow:1", "1"))
            .unwrap();
        assert!(!second.first);
        assert!(state.is_consistent());
    }

    #[test]
    fn test_duplicate_mac_rejected() {
        let state = MacMapState::new();
        let host = MacVlan::new(mac(1), vlan(10));
        state.activate(host, &port("openflow:1", "1")).unwrap();
        state.take_dirty();

        let err = state
            .activate(MacVlan::new(mac(1), vlan(20)), &port("openflow:2", "5"))
            .unwrap_err();
        assert_eq!(
            err,
            VtnError::DuplicateMac {
                host: MacVlan::new(mac(1), vlan(20)),
                existing: host,
            }
        );
        assert_eq!(state.find(mac(1)), Some((host, port("openflow:1", "1"))));
        assert!(!state.take_dirty());
        assert!(state.is_consistent());
    }

    #[test]
    fn test_move_releases_old_port() {
        let state = MacMapState::new();
        let host = MacVlan::new(mac(1), vlan(10));
        state.activate(host, &port("openflow:1", "1")).unwrap();

        let act = state.activate(host, &port("openflow:1", "2")).unwrap();
        assert!(act.changed);
        assert_eq!(
            act.released,
            Some(PortVlan::new(port("openflow:1", "1"), vlan(10)))
        );
        assert_eq!(
            state.mapped_ports(),
            vec![PortVlan::new(port("openflow:1", "2"), vlan(10))]
        );
        assert!(state.is_consistent());
    }

    #[test]
    fn test_move_keeps_shared_port() {
        let state = MacMapState::new();
        let h1 = MacVlan::new(mac(1), vlan(10));
        let h2 = MacVlan::new(mac(2), vlan(10));
        state.activate(h1, &port("openflow:1", "1")).unwrap();
        state.activate(h2, &port("openflow:1", "1")).unwrap();

        let act = state.activate(h1, &port("openflow:1", "2")).unwrap();
        assert_eq!(act.released, None);
        assert!(state.is_consistent());
    }

    #[test]
    fn test_inactivate_variants() {
        let state = MacMapState::new();
        let p1 = port("openflow:1", "1");
        let p2 = port("openflow:2", "1");
        state.activate(MacVlan::new(mac(1), vlan(10)), &p1).unwrap();
        state.activate(MacVlan::new(mac(2), vlan(10)), &p1).unwrap();
        state.activate(MacVlan::new(mac(3), vlan(20)), &p1).unwrap();
        state.activate(MacVlan::new(mac(4), vlan(10)), &p2).unwrap();

        let result = state.inactivate_host(&MacVlan::new(mac(2), vlan(10)));
        assert_eq!(result.hosts, vec![(MacVlan::new(mac(2), vlan(10)), p1.clone())]);
        assert!(result.released.is_empty());
        assert!(state.is_consistent());

        let result = state.inactivate_port_vlan(&PortVlan::new(p1.clone(), vlan(10)));
        assert_eq!(result.hosts.len(), 1);
        assert_eq!(result.released, vec![PortVlan::new(p1.clone(), vlan(10))]);
        assert!(state.is_consistent());

        let result = state.inactivate_ports(|p| p.node.as_str() == "openflow:2");
        assert_eq!(result.hosts, vec![(MacVlan::new(mac(4), vlan(10)), p2.clone())]);
        assert!(state.is_consistent());

        let result = state.inactivate_unmapped(|host| host.vlan() != vlan(20));
        assert_eq!(result.released, vec![PortVlan::new(p1, vlan(20))]);
        assert!(!state.has_active_host());
        assert!(state.is_consistent());
    }

    #[test]
    fn test_reverse_index_consistency_over_sequence() {
        let state = MacMapState::new();
        let ports = [port("openflow:1", "1"), port("openflow:1", "2"), port("openflow:2", "1")];

        // Deterministic pseudo-random walk over activate/inactivate.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let host = MacVlan::new(mac(seed % 8), vlan((seed >> 8) as u16 % 3));
            let port = &ports[(seed >> 16) as usize % ports.len()];
            match (seed >> 24) % 5 {
                0 => {
                    state.inactivate_host(&host);
                }
                1 => {
                    state.inactivate_port_vlan(&PortVlan::new(port.clone(), host.vlan()));
                }
                2 => {
                    state.inactivate_ports(|p| p == port);
                }
                _ => {
                    let _ = state.activate(host, port);
                }
            }
            assert!(state.is_consistent());
        }
    }
}
