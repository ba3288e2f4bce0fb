//! Common types for the virtual tenant network control plane.
//!
//! This crate provides type-safe representations of the physical network
//! primitives that virtual network elements are mapped onto:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses, totally ordered
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers (0 means untagged)
//! - [`NodeId`]: identifier of a physical switch
//! - [`PhysicalPort`]: a concrete port on a physical switch
//! - [`SwitchPort`]: a partial port descriptor used by configuration

mod mac;
mod port;
mod vlan;

pub use mac::MacAddress;
pub use port::{NodeId, PhysicalPort, SwitchPort};
pub use vlan::VlanId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN ID: {0} (must be 0-4095)")]
    InvalidVlanId(u16),

    #[error("invalid node identifier: {0:?}")]
    InvalidNodeId(String),

    #[error("invalid switch port descriptor: {0}")]
    InvalidSwitchPort(String),
}
