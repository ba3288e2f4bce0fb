//! Port, VLAN and MAC mappings and the registry that keeps them exclusive.

mod host;
mod mac_map;
mod mac_state;
mod port_map;
mod registry;
mod vlan_map;

pub use host::{HostBinding, HostSet, MacVlan};
pub use mac_map::{MacMapChange, MacMapConfig, MacMapping};
pub use mac_state::{Activation, Inactivation, MacMapState};
pub use port_map::{PortMapConfig, PortVlan};
pub use registry::{MacMapUpdate, MappingRegistry};
pub use vlan_map::{NodeVlan, VlanMapping};
