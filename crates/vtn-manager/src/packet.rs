//! Frames and per-packet processing context.
//!
//! The frame model only carries the header fields that flow conditions
//! match on and flow actions rewrite. Payload bytes are opaque.

use std::net::Ipv4Addr;
use vtn_types::{MacAddress, VlanId};

use crate::mapping::PortVlan;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

/// Layer 4 header of an IPv4 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Header {
    Tcp { src_port: u16, dst_port: u16 },
    Udp { src_port: u16, dst_port: u16 },
    Icmp { icmp_type: u8, code: u8 },
}

impl L4Header {
    pub fn protocol(&self) -> u8 {
        match self {
            Self::Tcp { .. } => IP_PROTO_TCP,
            Self::Udp { .. } => IP_PROTO_UDP,
            Self::Icmp { .. } => IP_PROTO_ICMP,
        }
    }

    pub fn ports(&self) -> Option<(u16, u16)> {
        match *self {
            Self::Tcp { src_port, dst_port } | Self::Udp { src_port, dst_port } => {
                Some((src_port, dst_port))
            }
            Self::Icmp { .. } => None,
        }
    }
}

/// IPv4 header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inet4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub dscp: u8,
    /// IP protocol number. Equals `l4.protocol()` when `l4` is present.
    pub protocol: u8,
    pub l4: Option<L4Header>,
}

impl Inet4Header {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, l4: Option<L4Header>) -> Self {
        Self {
            src,
            dst,
            dscp: 0,
            protocol: l4.map(|h| h.protocol()).unwrap_or_default(),
            l4,
        }
    }
}

/// An Ethernet frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtherFrame {
    pub src: MacAddress,
    pub dst: MacAddress,
    /// VLAN of the frame, `VlanId::UNTAGGED` for untagged frames.
    pub vlan: VlanId,
    /// 802.1p priority.
    pub pcp: u8,
    pub ether_type: u16,
    pub inet4: Option<Inet4Header>,
    pub payload: Vec<u8>,
}

impl EtherFrame {
    pub fn new(src: MacAddress, dst: MacAddress, vlan: VlanId) -> Self {
        Self {
            src,
            dst,
            vlan,
            pcp: 0,
            ether_type: 0,
            inet4: None,
            payload: Vec::new(),
        }
    }

    pub fn with_ether_type(mut self, ether_type: u16) -> Self {
        self.ether_type = ether_type;
        self
    }

    pub fn with_inet4(mut self, header: Inet4Header) -> Self {
        self.ether_type = ETHER_TYPE_IPV4;
        self.inet4 = Some(header);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Returns true if the destination is a broadcast or multicast address.
    pub fn is_multicast(&self) -> bool {
        self.dst.is_multicast()
    }
}

/// State of one packet while it travels through the virtual network.
///
/// A flood replica is a clone with `flooding` set; mutations of one
/// replica never reach another.
#[derive(Debug, Clone)]
pub struct PacketContext {
    /// Frame as modified by flow actions so far.
    pub frame: EtherFrame,
    /// Physical port and VLAN the frame was received on.
    pub ingress: PortVlan,
    /// VLAN used when matching flow conditions.
    pub match_vlan: VlanId,
    /// Set once any non-empty filter chain has looked at the packet.
    pub filtered: bool,
    /// Skips flow filter evaluation for this packet.
    pub filter_disabled: bool,
    /// Set on per-destination copies of a flooded packet.
    pub flooding: bool,
    /// Number of redirections performed so far.
    pub redirect_hops: u32,
}

impl PacketContext {
    pub fn new(frame: EtherFrame, ingress: PortVlan) -> Self {
        let match_vlan = frame.vlan;
        Self {
            frame,
            ingress,
            match_vlan,
            filtered: false,
            filter_disabled: false,
            flooding: false,
            redirect_hops: 0,
        }
    }

    /// Returns true until the packet has been redirected once.
    pub fn is_first_pass(&self) -> bool {
        self.redirect_hops == 0
    }

    pub fn is_unicast(&self) -> bool {
        !self.frame.is_multicast()
    }

    /// Independent copy used for one flood destination.
    pub fn replica(&self) -> Self {
        let mut replica = self.clone();
        replica.flooding = true;
        replica
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vtn_types::{NodeId, PhysicalPort};

    fn ctx() -> PacketContext {
        let frame = EtherFrame::new(
            MacAddress::from_u64(1),
            MacAddress::BROADCAST,
            VlanId::new(10).unwrap(),
        );
        let port = PhysicalPort::new(NodeId::new("openflow:1").unwrap(), "OF", "1");
        PacketContext::new(frame, PortVlan::new(port, VlanId::new(10).unwrap()))
    }

    #[test]
    fn test_replica_is_independent() {
        let original = ctx();
        let mut replica = original.replica();
        replica.frame.src = MacAddress::from_u64(2);

        assert!(replica.flooding);
        assert!(!original.flooding);
        assert_eq!(original.frame.src, MacAddress::from_u64(1));
    }

    #[test]
    fn test_inet4_protocol() {
        let header = Inet4Header::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            Some(L4Header::Udp {
                src_port: 53,
                dst_port: 5353,
            }),
        );
        assert_eq!(header.protocol, IP_PROTO_UDP);
        let frame = ctx().frame.with_inet4(header);
        assert_eq!(frame.ether_type, ETHER_TYPE_IPV4);
        assert!(frame.is_multicast());
    }
}
