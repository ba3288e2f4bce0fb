//! In-memory topology used by `vtnd` and by tests.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use vtn_types::{NodeId, PhysicalPort, SwitchPort};

use super::{LinkEdge, Route, RouteResolver, TopologyOracle};
use crate::cost::CostPolicy;
use crate::error::{Result, VtnError};

/// One port of a switch in the topology description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default = "default_port_type")]
    pub port_type: String,
    pub id: String,
    pub name: String,
    /// False for ports that face other switches even without a known link.
    #[serde(default = "default_true")]
    pub edge: bool,
    #[serde(default = "default_true")]
    pub up: bool,
    /// Overrides the intrinsic cost of the port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub id: NodeId,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

/// A bidirectional inter-switch link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub source: PhysicalPort,
    pub destination: PhysicalPort,
}

/// Serializable description of a [`StaticTopology`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default = "default_intrinsic_cost")]
    pub intrinsic_cost: u64,
    #[serde(default)]
    pub nodes: Vec<SwitchConfig>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

fn default_port_type() -> String {
    "OF".to_string()
}

fn default_true() -> bool {
    true
}

fn default_intrinsic_cost() -> u64 {
    1
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            intrinsic_cost: default_intrinsic_cost(),
            nodes: Vec::new(),
            links: Vec::new(),
        }
    }
}

impl TopologyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.intrinsic_cost == 0 {
            return Err(VtnError::invalid_config("topology.intrinsic_cost", "must be > 0"));
        }
        let nodes: BTreeSet<&NodeId> = self.nodes.iter().map(|n| &n.id).collect();
        for link in &self.links {
            for end in [&link.source, &link.destination] {
                if !nodes.contains(&end.node) {
                    return Err(VtnError::invalid_config(
                        "topology.links",
                        format!("unknown node in link: {}", end),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct PortInfo {
    name: String,
    up: bool,
    edge: bool,
    cost: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    nodes: BTreeSet<NodeId>,
    ports: BTreeMap<PhysicalPort, PortInfo>,
    links: BTreeSet<LinkEdge>,
    intrinsic_cost: u64,
}

impl Inner {
    fn is_edge(&self, port: &PhysicalPort, info: &PortInfo) -> bool {
        info.edge && !self.links.iter().any(|l| l.source == *port || l.destination == *port)
    }

    fn intrinsic(&self, port: &PhysicalPort) -> u64 {
        self.ports
            .get(port)
            .and_then(|info| info.cost)
            .unwrap_or(self.intrinsic_cost)
    }
}

/// Topology held in memory and changed through method calls.
#[derive(Debug)]
pub struct StaticTopology {
    inner: RwLock<Inner>,
}

impl Default for StaticTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticTopology {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                nodes: BTreeSet::new(),
                ports: BTreeMap::new(),
                links: BTreeSet::new(),
                intrinsic_cost: default_intrinsic_cost(),
            }),
        }
    }

    pub fn from_config(config: &TopologyConfig) -> Result<Self> {
        config.validate()?;
        let topology = Self::new();
        topology.set_intrinsic_cost(config.intrinsic_cost);
        for node in &config.nodes {
            topology.add_node(node.id.clone());
            for port in &node.ports {
                let physical = PhysicalPort::new(node.id.clone(), port.port_type.clone(), port.id.clone());
                topology.add_port(physical.clone(), &port.name, port.edge);
                if !port.up {
                    topology.set_port_up(&physical, false);
                }
                if let Some(cost) = port.cost {
                    topology.set_port_cost(&physical, cost);
                }
            }
        }
        for link in &config.links {
            topology.add_link(link.source.clone(), link.destination.clone());
        }
        Ok(topology)
    }

    pub fn set_intrinsic_cost(&self, cost: u64) {
        self.inner.write().intrinsic_cost = cost.max(1);
    }

    pub fn add_node(&self, node: NodeId) -> bool {
        self.inner.write().nodes.insert(node)
    }

    /// Removes a switch together with its ports and links.
    pub fn remove_node(&self, node: &NodeId) -> bool {
        let mut inner = self.inner.write();
        if !inner.nodes.remove(node) {
            return false;
        }
        inner.ports.retain(|port, _| port.node != *node);
        inner
            .links
            .retain(|l| l.source.node != *node && l.destination.node != *node);
        debug!("{}: node removed from topology", node);
        true
    }

    /// Adds a port in the up state. The node is added if needed.
    pub fn add_port(&self, port: PhysicalPort, name: &str, edge: bool) {
        let mut inner = self.inner.write();
        inner.nodes.insert(port.node.clone());
        inner.ports.insert(
            port,
            PortInfo {
                name: name.to_string(),
                up: true,
                edge,
                cost: None,
            },
        );
    }

    pub fn remove_port(&self, port: &PhysicalPort) -> bool {
        let mut inner = self.inner.write();
        inner
            .links
            .retain(|l| l.source != *port && l.destination != *port);
        inner.ports.remove(port).is_some()
    }

    /// Returns false if the port is unknown.
    pub fn set_port_up(&self, port: &PhysicalPort, up: bool) -> bool {
        match self.inner.write().ports.get_mut(port) {
            Some(info) => {
                info.up = up;
                true
            }
            None => false,
        }
    }

    pub fn set_port_cost(&self, port: &PhysicalPort, cost: u64) -> bool {
        match self.inner.write().ports.get_mut(port) {
            Some(info) => {
                info.cost = Some(cost);
                true
            }
            None => false,
        }
    }

    /// Connects two ports in both directions. Linked ports are never edge
    /// ports.
    pub fn add_link(&self, a: PhysicalPort, b: PhysicalPort) {
        let link = LinkEdge::new(a, b);
        let mut inner = self.inner.write();
        inner.links.insert(link.reversed());
        inner.links.insert(link);
    }

    pub fn remove_link(&self, a: &PhysicalPort, b: &PhysicalPort) -> bool {
        let link = LinkEdge::new(a.clone(), b.clone());
        let mut inner = self.inner.write();
        let removed = inner.links.remove(&link);
        inner.links.remove(&link.reversed());
        removed
    }

    pub fn ports(&self, node: &NodeId) -> Vec<PhysicalPort> {
        self.inner
            .read()
            .ports
            .keys()
            .filter(|port| port.node == *node)
            .cloned()
            .collect()
    }
}

impl TopologyOracle for StaticTopology {
    fn node_exists(&self, node: &NodeId) -> bool {
        self.inner.read().nodes.contains(node)
    }

    fn has_edge_port(&self, node: Option<&NodeId>) -> bool {
        let inner = self.inner.read();
        inner.ports.iter().any(|(port, info)| {
            node.map_or(true, |n| port.node == *n) && info.up && inner.is_edge(port, info)
        })
    }

    fn is_port_up(&self, port: &PhysicalPort) -> bool {
        self.inner.read().ports.get(port).is_some_and(|info| info.up)
    }

    fn is_edge_port(&self, port: &PhysicalPort) -> bool {
        let inner = self.inner.read();
        inner
            .ports
            .get(port)
            .is_some_and(|info| inner.is_edge(port, info))
    }

    fn find_port(&self, node: &NodeId, desc: &SwitchPort) -> Option<PhysicalPort> {
        self.inner
            .read()
            .ports
            .iter()
            .find(|(port, info)| port.node == *node && port.matches(desc, Some(info.name.as_str())))
            .map(|(port, _)| port.clone())
    }

    fn port_name(&self, port: &PhysicalPort) -> Option<String> {
        self.inner.read().ports.get(port).map(|info| info.name.clone())
    }

    fn edge_ports(&self, node: Option<&NodeId>) -> Vec<PhysicalPort> {
        let inner = self.inner.read();
        inner
            .ports
            .iter()
            .filter(|(port, info)| {
                node.map_or(true, |n| port.node == *n) && info.up && inner.is_edge(port, info)
            })
            .map(|(port, _)| port.clone())
            .collect()
    }

    fn intrinsic_cost(&self, port: &PhysicalPort) -> u64 {
        self.inner.read().intrinsic(port)
    }
}

impl RouteResolver for StaticTopology {
    fn resolve(&self, source: &NodeId, destination: &NodeId, policy: &CostPolicy) -> Option<Route> {
        let inner = self.inner.read();
        if !inner.nodes.contains(source) || !inner.nodes.contains(destination) {
            return None;
        }
        if source == destination {
            return Some(Route::local(source.clone()));
        }

        // Usable links and their cost under the policy.
        let mut edges: BTreeMap<&NodeId, Vec<(&LinkEdge, u64)>> = BTreeMap::new();
        for link in &inner.links {
            let (Some(src), Some(dst)) = (inner.ports.get(&link.source), inner.ports.get(&link.destination)) else {
                continue;
            };
            if !src.up || !dst.up {
                continue;
            }
            let cost = policy.cost(&link.source, Some(src.name.as_str()), inner.intrinsic(&link.source));
            edges.entry(&link.source.node).or_default().push((link, cost));
        }

        // Dijkstra with an ordered candidate list.
        let mut done: BTreeMap<&NodeId, (u64, Option<&LinkEdge>)> = BTreeMap::new();
        let mut candidates: BTreeMap<(u64, &NodeId), Option<&LinkEdge>> = BTreeMap::new();
        candidates.insert((0, source), None);
        while let Some(((distance, node), via)) = candidates.pop_first() {
            if done.contains_key(node) {
                continue;
            }
            done.insert(node, (distance, via));
            if node == destination {
                break;
            }
            for (link, cost) in edges.get(node).into_iter().flatten() {
                let next = &link.destination.node;
                if !done.contains_key(next) {
                    candidates.insert((distance.saturating_add(*cost), next), Some(*link));
                }
            }
        }

        let (cost, _) = *done.get(destination)?;
        let mut links = Vec::new();
        let mut cursor = destination;
        while let Some((_, Some(link))) = done.get(cursor) {
            links.push((*link).clone());
            cursor = &link.source.node;
        }
        links.reverse();
        Some(Route {
            source: source.clone(),
            destination: destination.clone(),
            links,
            cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::PortLocation;
    use pretty_assertions::assert_eq;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn port(n: &str, id: &str) -> PhysicalPort {
        PhysicalPort::new(node(n), "OF", id)
    }

    /// openflow:1 -- openflow:2 -- openflow:3, plus a direct 1 -- 3 link.
    fn triangle() -> StaticTopology {
        let topology = StaticTopology::new();
        for (n, p, name) in [
            ("openflow:1", "1", "eth1"),
            ("openflow:1", "2", "eth2"),
            ("openflow:1", "3", "eth3"),
            ("openflow:2", "1", "eth1"),
            ("openflow:2", "2", "eth2"),
            ("openflow:3", "1", "eth1"),
            ("openflow:3", "2", "eth2"),
            ("openflow:3", "3", "eth3"),
        ] {
            topology.add_port(port(n, p), name, true);
        }
        topology.add_link(port("openflow:1", "2"), port("openflow:2", "1"));
        topology.add_link(port("openflow:2", "2"), port("openflow:3", "1"));
        topology.add_link(port("openflow:1", "3"), port("openflow:3", "2"));
        topology
    }

    #[test]
    fn test_edge_ports() {
        let topology = triangle();
        assert!(topology.is_edge_port(&port("openflow:1", "1")));
        assert!(!topology.is_edge_port(&port("openflow:1", "2")));
        assert_eq!(topology.edge_ports(Some(&node("openflow:2"))), Vec::<PhysicalPort>::new());
        assert!(!topology.has_edge_port(Some(&node("openflow:2"))));
        assert_eq!(
            topology.edge_ports(None),
            vec![port("openflow:1", "1"), port("openflow:3", "3")]
        );

        topology.set_port_up(&port("openflow:1", "1"), false);
        assert!(!topology.has_edge_port(Some(&node("openflow:1"))));
    }

    #[test]
    fn test_find_port_by_name() {
        let topology = triangle();
        assert_eq!(
            topology.find_port(&node("openflow:3"), &SwitchPort::by_name("eth3")),
            Some(port("openflow:3", "3"))
        );
        assert_eq!(
            topology.find_port(&node("openflow:3"), &SwitchPort::exact("OF", "3", "eth1")),
            None
        );
    }

    #[test]
    fn test_route_follows_policy() {
        let topology = triangle();
        let intrinsic = CostPolicy::new(0);
        let route = topology
            .resolve(&node("openflow:1"), &node("openflow:3"), &intrinsic)
            .unwrap();
        assert_eq!(route.links, vec![LinkEdge::new(port("openflow:1", "3"), port("openflow:3", "2"))]);
        assert_eq!(route.cost, 1);

        let policy = CostPolicy::new(1);
        policy
            .set_cost(
                PortLocation::new(node("openflow:1"), Some(SwitchPort::by_name("eth3"))),
                100,
            )
            .unwrap();
        let route = topology
            .resolve(&node("openflow:1"), &node("openflow:3"), &policy)
            .unwrap();
        assert_eq!(route.links.len(), 2);
        assert_eq!(route.links[0].source, port("openflow:1", "2"));
        assert_eq!(route.cost, 2);
    }

    #[test]
    fn test_no_route_without_links() {
        let topology = triangle();
        topology.add_port(port("openflow:4", "1"), "eth1", true);
        let policy = CostPolicy::new(0);
        assert_eq!(topology.resolve(&node("openflow:1"), &node("openflow:4"), &policy), None);
        assert!(topology
            .resolve(&node("openflow:4"), &node("openflow:4"), &policy)
            .is_some_and(|r| r.is_local()));

        topology.set_port_up(&port("openflow:1", "3"), false);
        topology.remove_node(&node("openflow:2"));
        assert_eq!(topology.resolve(&node("openflow:1"), &node("openflow:3"), &policy), None);
    }

    #[test]
    fn test_from_config() {
        let config: TopologyConfig = toml::from_str(
            r#"
            [[nodes]]
            id = "openflow:1"
            ports = [
                { id = "1", name = "eth1" },
                { id = "2", name = "eth2", up = false },
            ]

            [[nodes]]
            id = "openflow:2"
            ports = [{ id = "1", name = "eth1", cost = 10 }]

            [[links]]
            source = { node = "openflow:1", port_type = "OF", id = "2" }
            destination = { node = "openflow:2", port_type = "OF", id = "1" }
            "#,
        )
        .unwrap();
        let topology = StaticTopology::from_config(&config).unwrap();
        assert!(topology.is_port_up(&port("openflow:1", "1")));
        assert!(!topology.is_port_up(&port("openflow:1", "2")));
        assert!(!topology.is_edge_port(&port("openflow:2", "1")));
        assert_eq!(topology.intrinsic_cost(&port("openflow:2", "1")), 10);
        assert_eq!(topology.intrinsic_cost(&port("openflow:1", "1")), 1);

        let mut bad = config;
        bad.links[0].destination = port("openflow:9", "1");
        assert!(StaticTopology::from_config(&bad).is_err());
    }
}
