//! Packet-modifying flow actions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use vtn_types::MacAddress;

use crate::error::{Result, VtnError};
use crate::packet::{L4Header, PacketContext};

/// An action that rewrites a header field of a matched packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowAction {
    SetDlSrc(MacAddress),
    SetDlDst(MacAddress),
    SetVlanPcp(u8),
    SetInet4Src(Ipv4Addr),
    SetInet4Dst(Ipv4Addr),
    SetDscp(u8),
    SetTpSrc(u16),
    SetTpDst(u16),
    SetIcmpType(u8),
    SetIcmpCode(u8),
}

impl FlowAction {
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::SetDlSrc(mac) | Self::SetDlDst(mac) if !mac.is_host_address() => Err(
                VtnError::invalid_config("flow-action", format!("{}: not a unicast address", self)),
            ),
            Self::SetVlanPcp(pcp) if pcp > 7 => Err(VtnError::invalid_config(
                "flow-action",
                format!("PCP must be in 0-7: {}", pcp),
            )),
            Self::SetDscp(dscp) if dscp > 63 => Err(VtnError::invalid_config(
                "flow-action",
                format!("DSCP must be in 0-63: {}", dscp),
            )),
            _ => Ok(()),
        }
    }

    /// Applies the action to the packet.
    ///
    /// Returns false if the packet does not carry the header the action
    /// rewrites; the packet is left untouched in that case.
    pub fn apply(&self, ctx: &mut PacketContext) -> bool {
        let frame = &mut ctx.frame;
        match *self {
            Self::SetDlSrc(mac) => frame.src = mac,
            Self::SetDlDst(mac) => frame.dst = mac,
            Self::SetVlanPcp(pcp) => {
                if frame.vlan.is_untagged() {
                    return false;
                }
                frame.pcp = pcp;
            }
            Self::SetInet4Src(addr) => match &mut frame.inet4 {
                Some(ip) => ip.src = addr,
                None => return false,
            },
            Self::SetInet4Dst(addr) => match &mut frame.inet4 {
                Some(ip) => ip.dst = addr,
                None => return false,
            },
            Self::SetDscp(dscp) => match &mut frame.inet4 {
                Some(ip) => ip.dscp = dscp,
                None => return false,
            },
            Self::SetTpSrc(port) | Self::SetTpDst(port) => {
                let src = matches!(self, Self::SetTpSrc(_));
                let l4 = frame.inet4.as_mut().and_then(|ip| ip.l4.as_mut());
                match l4 {
                    Some(L4Header::Tcp { src_port, dst_port })
                    | Some(L4Header::Udp { src_port, dst_port }) => {
                        if src {
                            *src_port = port;
                        } else {
                            *dst_port = port;
                        }
                    }
                    _ => return false,
                }
            }
            Self::SetIcmpType(value) | Self::SetIcmpCode(value) => {
                let is_type = matches!(self, Self::SetIcmpType(_));
                let l4 = frame.inet4.as_mut().and_then(|ip| ip.l4.as_mut());
                match l4 {
                    Some(L4Header::Icmp { icmp_type, code }) => {
                        if is_type {
                            *icmp_type = value;
                        } else {
                            *code = value;
                        }
                    }
                    _ => return false,
                }
            }
        }
        true
    }
}

impl fmt::Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetDlSrc(mac) => write!(f, "set-dl-src={}", mac),
            Self::SetDlDst(mac) => write!(f, "set-dl-dst={}", mac),
            Self::SetVlanPcp(pcp) => write!(f, "set-vlan-pcp={}", pcp),
            Self::SetInet4Src(addr) => write!(f, "set-inet4-src={}", addr),
            Self::SetInet4Dst(addr) => write!(f, "set-inet4-dst={}", addr),
            Self::SetDscp(dscp) => write!(f, "set-dscp={}", dscp),
            Self::SetTpSrc(port) => write!(f, "set-tp-src={}", port),
            Self::SetTpDst(port) => write!(f, "set-tp-dst={}", port),
            Self::SetIcmpType(value) => write!(f, "set-icmp-type={}", value),
            Self::SetIcmpCode(value) => write!(f, "set-icmp-code={}", value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::PortVlan;
    use crate::packet::{EtherFrame, Inet4Header};
    use pretty_assertions::assert_eq;
    use vtn_types::{NodeId, PhysicalPort, VlanId};

    fn ctx(vlan: u16, l4: Option<L4Header>) -> PacketContext {
        let frame = EtherFrame::new(
            MacAddress::from_u64(1),
            MacAddress::from_u64(2),
            VlanId::new(vlan).unwrap(),
        )
        .with_inet4(Inet4Header::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            l4,
        ));
        let port = PhysicalPort::new(NodeId::new("openflow:1").unwrap(), "OF", "1");
        PacketContext::new(frame, PortVlan::new(port, VlanId::new(vlan).unwrap()))
    }

    #[test]
    fn test_validate() {
        assert!(FlowAction::SetVlanPcp(7).validate().is_ok());
        assert!(FlowAction::SetVlanPcp(8).validate().is_err());
        assert!(FlowAction::SetDscp(64).validate().is_err());
        assert!(FlowAction::SetDlSrc(MacAddress::BROADCAST).validate().is_err());
        assert!(FlowAction::SetDlDst(MacAddress::from_u64(5)).validate().is_ok());
    }

    #[test]
    fn test_apply_tcp_ports() {
        let mut packet = ctx(0, Some(L4Header::Tcp { src_port: 1, dst_port: 2 }));
        assert!(FlowAction::SetTpDst(8080).apply(&mut packet));
        assert!(!FlowAction::SetIcmpType(3).apply(&mut packet));
        assert_eq!(
            packet.frame.inet4.as_ref().and_then(|ip| ip.l4),
            Some(L4Header::Tcp {
                src_port: 1,
                dst_port: 8080
            })
        );
    }

    #[test]
    fn test_pcp_needs_tag() {
        let mut untagged = ctx(0, None);
        assert!(!FlowAction::SetVlanPcp(3).apply(&mut untagged));
        let mut tagged = ctx(10, None);
        assert!(FlowAction::SetVlanPcp(3).apply(&mut tagged));
        assert_eq!(tagged.frame.pcp, 3);
    }

    #[test]
    fn test_apply_addresses() {
        let mut packet = ctx(0, None);
        assert!(FlowAction::SetInet4Dst(Ipv4Addr::new(192, 168, 0, 1)).apply(&mut packet));
        assert!(FlowAction::SetDlSrc(MacAddress::from_u64(9)).apply(&mut packet));
        assert_eq!(packet.frame.src, MacAddress::from_u64(9));
        assert_eq!(
            packet.frame.inet4.map(|ip| ip.dst),
            Some(Ipv4Addr::new(192, 168, 0, 1))
        );
    }
}
