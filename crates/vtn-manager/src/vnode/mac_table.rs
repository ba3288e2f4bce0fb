//! MAC addresses learned by a virtual bridge.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;
use vtn_types::{MacAddress, NodeId, PhysicalPort};

use crate::mapping::PortVlan;

/// Hosts a bridge learns before new source addresses are ignored.
pub const DEFAULT_MAC_TABLE_LIMIT: usize = 65_536;

/// Where a host was last seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MacTableEntry {
    pub mac: MacAddress,
    pub port_vlan: PortVlan,
    /// Interface the host was mapped to, if it came in through a port
    /// mapping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

#[derive(Debug)]
struct Learned {
    entry: MacTableEntry,
    last_seen: Instant,
}

/// Learned hosts of one bridge, one entry per MAC address.
///
/// Learning happens while the bridge is only read-locked, so the table
/// carries its own lock. Entries not refreshed within the aging interval
/// are removed by [`MacTable::age_out`].
#[derive(Debug)]
pub struct MacTable {
    entries: Mutex<BTreeMap<MacAddress, Learned>>,
    limit: usize,
}

impl Default for MacTable {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAC_TABLE_LIMIT)
    }
}

impl MacTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table that holds at most `limit` hosts.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Records `mac` on `port_vlan`. Returns true if the entry is new or
    /// the host moved. Multicast sources are never learned, and a full
    /// table only refreshes the hosts it already holds.
    pub fn learn(&self, mac: MacAddress, port_vlan: &PortVlan, interface: Option<&str>) -> bool {
        if !mac.is_host_address() {
            return false;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(&mac) {
            Some(learned) => {
                learned.last_seen = now;
                if learned.entry.port_vlan == *port_vlan && learned.entry.interface.as_deref() == interface {
                    return false;
                }
                learned.entry.port_vlan = port_vlan.clone();
                learned.entry.interface = interface.map(str::to_string);
            }
            None => {
                if entries.len() >= self.limit {
                    debug!("MAC table full ({} hosts), {} not learned", self.limit, mac);
                    return false;
                }
                entries.insert(
                    mac,
                    Learned {
                        entry: MacTableEntry {
                            mac,
                            port_vlan: port_vlan.clone(),
                            interface: interface.map(str::to_string),
                        },
                        last_seen: now,
                    },
                );
            }
        }
        true
    }

    pub fn lookup(&self, mac: MacAddress) -> Option<MacTableEntry> {
        self.entries.lock().get(&mac).map(|learned| learned.entry.clone())
    }

    pub fn remove(&self, mac: MacAddress) -> Option<MacTableEntry> {
        self.entries.lock().remove(&mac).map(|learned| learned.entry)
    }

    /// Removes the hosts not seen for `max_age` and returns them.
    pub fn age_out(&self, max_age: Duration) -> Vec<MacTableEntry> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<MacAddress> = entries
            .iter()
            .filter(|(_, learned)| now.duration_since(learned.last_seen) >= max_age)
            .map(|(mac, _)| *mac)
            .collect();
        expired
            .into_iter()
            .filter_map(|mac| entries.remove(&mac).map(|learned| learned.entry))
            .collect()
    }

    /// Keeps the entries `keep` accepts. Returns the number removed.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&MacTableEntry) -> bool,
    {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, learned| keep(&learned.entry));
        before - entries.len()
    }

    pub fn flush_port_vlan(&self, port_vlan: &PortVlan) -> usize {
        self.retain(|entry| entry.port_vlan != *port_vlan)
    }

    pub fn flush_port(&self, port: &PhysicalPort) -> usize {
        self.retain(|entry| entry.port_vlan.port != *port)
    }

    pub fn flush_node(&self, node: &NodeId) -> usize {
        self.retain(|entry| entry.port_vlan.port.node != *node)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn entries(&self) -> Vec<MacTableEntry> {
        self.entries.lock().values().map(|learned| learned.entry.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vtn_types::VlanId;

    fn pv(node: &str, port: &str, vlan: u16) -> PortVlan {
        PortVlan::new(
            PhysicalPort::new(NodeId::new(node).unwrap(), "OF", port),
            VlanId::new(vlan).unwrap(),
        )
    }

    #[test]
    fn test_learn_and_move() {
        let table = MacTable::new();
        let mac = MacAddress::from_u64(0x10);
        assert!(table.learn(mac, &pv("openflow:1", "1", 0), Some("if1")));
        assert!(!table.learn(mac, &pv("openflow:1", "1", 0), Some("if1")));
        assert!(table.learn(mac, &pv("openflow:2", "1", 0), None));
        assert_eq!(table.lookup(mac).map(|e| e.port_vlan), Some(pv("openflow:2", "1", 0)));
        assert!(!table.learn(MacAddress::BROADCAST, &pv("openflow:1", "1", 0), None));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_flush() {
        let table = MacTable::new();
        table.learn(MacAddress::from_u64(1), &pv("openflow:1", "1", 0), None);
        table.learn(MacAddress::from_u64(2), &pv("openflow:1", "1", 10), None);
        table.learn(MacAddress::from_u64(3), &pv("openflow:1", "2", 0), None);
        table.learn(MacAddress::from_u64(4), &pv("openflow:2", "1", 0), None);

        assert_eq!(table.flush_port_vlan(&pv("openflow:1", "1", 10)), 1);
        assert_eq!(table.flush_port(&pv("openflow:1", "1", 0).port), 1);
        assert_eq!(table.flush_node(&NodeId::new("openflow:2").unwrap()), 1);
        assert_eq!(
            table.entries().into_iter().map(|e| e.mac).collect::<Vec<_>>(),
            vec![MacAddress::from_u64(3)]
        );
    }

    #[test]
    fn test_limit() {
        let table = MacTable::with_limit(2);
        assert!(table.learn(MacAddress::from_u64(1), &pv("openflow:1", "1", 0), None));
        assert!(table.learn(MacAddress::from_u64(2), &pv("openflow:1", "1", 0), None));
        assert!(!table.learn(MacAddress::from_u64(3), &pv("openflow:1", "1", 0), None));
        assert_eq!(table.len(), 2);

        // Known hosts still move when the table is full.
        assert!(table.learn(MacAddress::from_u64(2), &pv("openflow:1", "2", 0), None));
        table.remove(MacAddress::from_u64(1));
        assert!(table.learn(MacAddress::from_u64(3), &pv("openflow:1", "1", 0), None));
    }

    #[test]
    fn test_age_out() {
        let table = MacTable::new();
        table.learn(MacAddress::from_u64(1), &pv("openflow:1", "1", 0), None);
        table.learn(MacAddress::from_u64(2), &pv("openflow:1", "2", 0), Some("if1"));

        assert!(table.age_out(Duration::from_secs(600)).is_empty());
        assert_eq!(table.len(), 2);

        let expired = table.age_out(Duration::ZERO);
        assert_eq!(
            expired.into_iter().map(|e| e.mac).collect::<Vec<_>>(),
            vec![MacAddress::from_u64(1), MacAddress::from_u64(2)]
        );
        assert!(table.is_empty());
    }
}
