//! Named flow conditions referenced by flow filter rules.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use vtn_types::{MacAddress, VlanId};

use crate::error::{Result, VtnError};
use crate::event::UpdateKind;
use crate::packet::{L4Header, PacketContext};
use crate::path::check_name;

/// IPv4 network used as a match field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inet4Match {
    pub address: Ipv4Addr,
    #[serde(default = "default_prefix")]
    pub prefix: u8,
}

fn default_prefix() -> u8 {
    32
}

impl Inet4Match {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        if self.prefix == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - u32::from(self.prefix.min(32)));
        (u32::from(self.address) & mask) == (u32::from(addr) & mask)
    }
}

/// Inclusive range of layer 4 ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub from: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<u16>,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.from && port <= self.to.unwrap_or(self.from)
    }
}

/// One set of header fields. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowMatch {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dl_src: Option<MacAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dl_dst: Option<MacAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vlan: Option<VlanId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vlan_pcp: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ether_type: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inet4_src: Option<Inet4Match>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inet4_dst: Option<Inet4Match>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_proto: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dscp: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tp_src: Option<PortRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tp_dst: Option<PortRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp_code: Option<u8>,
}

impl FlowMatch {
    pub fn matches(&self, ctx: &PacketContext) -> bool {
        let frame = &ctx.frame;
        if self.dl_src.is_some_and(|mac| mac != frame.src)
            || self.dl_dst.is_some_and(|mac| mac != frame.dst)
            || self.vlan.is_some_and(|vlan| vlan != ctx.match_vlan)
            || self.vlan_pcp.is_some_and(|pcp| pcp != frame.pcp)
            || self.ether_type.is_some_and(|t| t != frame.ether_type)
        {
            return false;
        }
        if !self.needs_inet4() {
            return true;
        }

        let Some(ip) = &frame.inet4 else {
            return false;
        };
        if self.inet4_src.is_some_and(|net| !net.contains(ip.src))
            || self.inet4_dst.is_some_and(|net| !net.contains(ip.dst))
            || self.ip_proto.is_some_and(|proto| proto != ip.protocol)
            || self.dscp.is_some_and(|dscp| dscp != ip.dscp)
        {
            return false;
        }

        if self.tp_src.is_some() || self.tp_dst.is_some() {
            let Some((src, dst)) = ip.l4.and_then(|l4| l4.ports()) else {
                return false;
            };
            if self.tp_src.is_some_and(|r| !r.contains(src))
                || self.tp_dst.is_some_and(|r| !r.contains(dst))
            {
                return false;
            }
        }
        if self.icmp_type.is_some() || self.icmp_code.is_some() {
            let Some(L4Header::Icmp { icmp_type, code }) = ip.l4 else {
                return false;
            };
            if self.icmp_type.is_some_and(|t| t != icmp_type)
                || self.icmp_code.is_some_and(|c| c != code)
            {
                return false;
            }
        }
        true
    }

    fn needs_inet4(&self) -> bool {
        self.inet4_src.is_some()
            || self.inet4_dst.is_some()
            || self.ip_proto.is_some()
            || self.dscp.is_some()
            || self.tp_src.is_some()
            || self.tp_dst.is_some()
            || self.icmp_type.is_some()
            || self.icmp_code.is_some()
    }
}

/// A named flow condition.
///
/// A packet satisfies the condition if it matches any of its matches,
/// tried in ascending index order. A condition without matches is
/// satisfied by every packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowCondition {
    pub name: String,
    #[serde(default)]
    pub matches: Vec<FlowMatch>,
}

impl FlowCondition {
    pub fn new(name: impl Into<String>, mut matches: Vec<FlowMatch>) -> Self {
        matches.sort_by_key(|m| m.index);
        Self {
            name: name.into(),
            matches,
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_name("flow-condition", &self.name)?;
        for m in &self.matches {
            if m.inet4_src.is_some_and(|n| n.prefix > 32) || m.inet4_dst.is_some_and(|n| n.prefix > 32) {
                return Err(VtnError::invalid_config(
                    "flow-condition",
                    format!("{}: invalid IPv4 prefix length", self.name),
                ));
            }
            if m.vlan_pcp.is_some_and(|pcp| pcp > 7) || m.dscp.is_some_and(|dscp| dscp > 63) {
                return Err(VtnError::invalid_config(
                    "flow-condition",
                    format!("{}: PCP or DSCP out of range", self.name),
                ));
            }
        }
        Ok(())
    }

    pub fn matches(&self, ctx: &PacketContext) -> bool {
        self.matches.is_empty() || self.matches.iter().any(|m| m.matches(ctx))
    }
}

/// Resolves condition names for filter evaluation.
pub trait ConditionEvaluator: Send + Sync {
    fn condition(&self, name: &str) -> Option<Arc<FlowCondition>>;
}

/// In-memory condition store.
#[derive(Debug, Default)]
pub struct ConditionTable {
    conditions: RwLock<BTreeMap<String, Arc<FlowCondition>>>,
}

impl ConditionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_conditions<I>(conditions: I) -> Result<Self>
    where
        I: IntoIterator<Item = FlowCondition>,
    {
        let table = Self::new();
        for condition in conditions {
            table.set(condition)?;
        }
        Ok(table)
    }

    pub fn set(&self, condition: FlowCondition) -> Result<Option<UpdateKind>> {
        condition.validate()?;
        let condition = FlowCondition::new(condition.name, condition.matches);
        let mut conditions = self.conditions.write();
        let kind = match conditions.get(&condition.name) {
            Some(old) if **old == condition => return Ok(None),
            Some(_) => UpdateKind::Changed,
            None => UpdateKind::Added,
        };
        conditions.insert(condition.name.clone(), Arc::new(condition));
        Ok(Some(kind))
    }

    pub fn remove(&self, name: &str) -> Option<UpdateKind> {
        self.conditions
            .write()
            .remove(name)
            .map(|_| UpdateKind::Removed)
    }

    pub fn names(&self) -> Vec<String> {
        self.conditions.read().keys().cloned().collect()
    }
}

impl ConditionEvaluator for ConditionTable {
    fn condition(&self, name: &str) -> Option<Arc<FlowCondition>> {
        self.conditions.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::PortVlan;
    use crate::packet::{EtherFrame, Inet4Header};
    use pretty_assertions::assert_eq;
    use vtn_types::{NodeId, PhysicalPort};

    fn ctx(src: u64) -> PacketContext {
        let frame = EtherFrame::new(
            MacAddress::from_u64(src),
            MacAddress::from_u64(0xaa),
            VlanId::UNTAGGED,
        )
        .with_inet4(Inet4Header::new(
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(10, 0, 0, 1),
            Some(L4Header::Tcp {
                src_port: 40000,
                dst_port: 80,
            }),
        ));
        let port = PhysicalPort::new(NodeId::new("openflow:1").unwrap(), "OF", "1");
        PacketContext::new(frame, PortVlan::new(port, VlanId::UNTAGGED))
    }

    #[test]
    fn test_dl_src_match() {
        let cond = FlowCondition::new(
            "C1",
            vec![FlowMatch {
                dl_src: Some("00:11:22:33:44:55".parse().unwrap()),
                ..Default::default()
            }],
        );
        assert!(cond.matches(&ctx(0x0011_2233_4455)));
        assert!(!cond.matches(&ctx(1)));
    }

    #[test]
    fn test_inet4_and_ports() {
        let m = FlowMatch {
            inet4_src: Some(Inet4Match {
                address: Ipv4Addr::new(192, 168, 1, 0),
                prefix: 24,
            }),
            tp_dst: Some(PortRange {
                from: 80,
                to: Some(443),
            }),
            ..Default::default()
        };
        assert!(m.matches(&ctx(1)));

        let icmp = FlowMatch {
            icmp_type: Some(8),
            ..Default::default()
        };
        assert!(!icmp.matches(&ctx(1)));
    }

    #[test]
    fn test_match_uses_match_vlan() {
        let m = FlowMatch {
            vlan: Some(VlanId::new(5).unwrap()),
            ..Default::default()
        };
        let mut packet = ctx(1);
        assert!(!m.matches(&packet));
        packet.match_vlan = VlanId::new(5).unwrap();
        assert!(m.matches(&packet));
    }

    #[test]
    fn test_table() {
        let table = ConditionTable::new();
        let cond = FlowCondition::new("C1", Vec::new());
        assert_eq!(table.set(cond.clone()).unwrap(), Some(UpdateKind::Added));
        assert_eq!(table.set(cond).unwrap(), None);
        assert!(table.condition("C1").is_some());
        assert!(table.set(FlowCondition::new("_bad", Vec::new())).is_err());
        assert_eq!(table.remove("C1"), Some(UpdateKind::Removed));
        assert!(table.condition("C1").is_none());
    }
}
