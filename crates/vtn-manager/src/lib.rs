//! Virtual Tenant Network control-plane core.
//!
//! Maps physical network events onto a tree of virtual networks:
//! tenants contain virtual bridges and terminals, which own virtual
//! interfaces and mappings that bind them to physical ports, VLANs or
//! MAC addresses.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────────── VtnManager ─────────────────────┐
//!  packets ───►│ PacketClassifier ─► FilterChain ─► route ─► transmit │───► ForwardingSink
//!  topology ──►│ port / VLAN / MAC mappings ─► node state fold        │───► VtnListener
//!  admin API ─►│ MappingRegistry (exclusive ownership of mappings)    │───► ConfigPersistence
//!              └──────────────────────────────────────────────────────┘
//!                  ▲ TopologyOracle   ▲ RouteResolver   ▲ ConditionEvaluator
//! ```
//!
//! The topology, route computation, condition store, frame transmission
//! and persistence are collaborators behind traits; [`topology`] provides
//! an in-memory implementation of the first two.

pub mod classifier;
pub mod condition;
pub mod config;
pub mod cost;
pub mod error;
pub mod event;
pub mod filter;
pub mod manager;
pub mod mapping;
pub mod packet;
pub mod path;
pub mod state;
pub mod topology;
pub mod vnode;

pub use classifier::{MapKind, MappedNode, PacketClassifier};
pub use condition::{ConditionEvaluator, ConditionTable, FlowCondition, FlowMatch};
pub use config::{ConfigError, TenantConfig, VInterfaceConfig, VNodeConfig, VtnConfig};
pub use cost::{CostPolicy, PathPolicyConfig, PathPolicySet, PortLocation};
pub use error::{Result, VtnError};
pub use event::{UpdateKind, VtnEvent, VtnListener};
pub use filter::{Direction, DropReason, FilterChain, FilterKind, FilterRule, PacketSignal, RedirectDestination};
pub use manager::{Collaborators, FilterTarget, PacketOutcome, Tenant, VtnManager};
pub use mapping::{MacMapChange, MacMapConfig, MacVlan, MappingRegistry, NodeVlan, PortMapConfig, PortVlan};
pub use packet::{EtherFrame, PacketContext};
pub use path::{InterfacePath, NodePath, VlanMapPath};
pub use state::VnodeState;
pub use topology::{ConfigPersistence, ForwardingSink, RouteResolver, StaticTopology, TopologyOracle};
pub use vnode::NodeKind;

pub use vtn_types::{MacAddress, NodeId, PhysicalPort, SwitchPort, VlanId};
