//! Interfaces to the physical network.
//!
//! The manager never discovers switches, computes paths or programs flows
//! itself. It asks a [`TopologyOracle`] about switches and ports, a
//! [`RouteResolver`] for paths, and hands forwarding decisions to a
//! [`ForwardingSink`]. Configuration changes made through the API are
//! offered to an optional [`ConfigPersistence`].

mod static_topology;

pub use static_topology::{LinkConfig, PortConfig, StaticTopology, SwitchConfig, TopologyConfig};

use serde::{Deserialize, Serialize};
use vtn_types::{MacAddress, NodeId, PhysicalPort, SwitchPort};

use crate::config::TenantConfig;
use crate::cost::CostPolicy;
use crate::mapping::PortVlan;
use crate::packet::EtherFrame;
use crate::path::NodePath;

/// Read-only view of the physical topology.
pub trait TopologyOracle: Send + Sync {
    fn node_exists(&self, node: &NodeId) -> bool;

    /// Returns true if `node` (any node if `None`) has a port that is up
    /// and not connected to another switch.
    fn has_edge_port(&self, node: Option<&NodeId>) -> bool;

    fn is_port_up(&self, port: &PhysicalPort) -> bool;

    fn is_edge_port(&self, port: &PhysicalPort) -> bool;

    /// Resolves a port descriptor on `node`.
    fn find_port(&self, node: &NodeId, desc: &SwitchPort) -> Option<PhysicalPort>;

    fn port_name(&self, port: &PhysicalPort) -> Option<String>;

    /// Edge ports that are up, on `node` or on every node.
    fn edge_ports(&self, node: Option<&NodeId>) -> Vec<PhysicalPort>;

    /// Cost of transmitting from `port` when no cost policy applies.
    fn intrinsic_cost(&self, port: &PhysicalPort) -> u64;
}

/// A directed inter-switch link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkEdge {
    pub source: PhysicalPort,
    pub destination: PhysicalPort,
}

impl LinkEdge {
    pub fn new(source: PhysicalPort, destination: PhysicalPort) -> Self {
        Self {
            source,
            destination,
        }
    }

    pub fn reversed(&self) -> Self {
        Self::new(self.destination.clone(), self.source.clone())
    }
}

/// Path between two switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub source: NodeId,
    pub destination: NodeId,
    /// Links in the order they are traversed. Empty if source and
    /// destination are the same switch.
    pub links: Vec<LinkEdge>,
    pub cost: u64,
}

impl Route {
    /// The trivial route inside one switch.
    pub fn local(node: NodeId) -> Self {
        Self {
            source: node.clone(),
            destination: node,
            links: Vec::new(),
            cost: 0,
        }
    }

    pub fn is_local(&self) -> bool {
        self.links.is_empty()
    }
}

/// Shortest-path computation.
pub trait RouteResolver: Send + Sync {
    /// Returns the cheapest route from `source` to `destination` under
    /// `policy`, or `None` if the switches are not connected.
    fn resolve(&self, source: &NodeId, destination: &NodeId, policy: &CostPolicy) -> Option<Route>;
}

/// Unicast flow decided by the forwarding pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowSpec {
    /// Bridge that forwarded the packet.
    pub owner: NodePath,
    pub ingress: PortVlan,
    pub egress: PortVlan,
    pub src: MacAddress,
    pub dst: MacAddress,
    pub route: Route,
}

/// Programs flows and emits frames on physical ports.
pub trait ForwardingSink: Send + Sync {
    /// Sends `frame` out of `port`. `frame.vlan` is the egress VLAN.
    fn transmit(&self, port: &PhysicalPort, frame: &EtherFrame);

    /// Installs the flow that forwards subsequent packets without
    /// consulting the manager.
    fn install_flow(&self, flow: &FlowSpec);
}

/// Stores tenant configuration changed through the API.
///
/// Implementations handle their own failures; the manager never waits on
/// or retries a save.
pub trait ConfigPersistence: Send + Sync {
    fn save(&self, tenant: &TenantConfig);

    fn remove(&self, tenant: &str);
}
