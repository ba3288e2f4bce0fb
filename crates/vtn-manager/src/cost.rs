//! Path policies: per-port link costs used by the route resolver.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{btree_map, BTreeMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};
use vtn_types::{NodeId, PhysicalPort, SwitchPort};

use crate::error::{Result, VtnError};
use crate::event::UpdateKind;

/// Cost value meaning "not defined".
pub const COST_UNDEFINED: u64 = 0;

/// Identifier of the built-in policy that only uses intrinsic link costs.
pub const POLICY_INTRINSIC: u32 = 0;

/// Highest configurable path policy identifier.
pub const POLICY_ID_MAX: u32 = 3;

/// Switch port selector of a cost entry. `port == None` selects every port
/// of the node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortLocation {
    pub node: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<SwitchPort>,
}

impl PortLocation {
    pub fn new(node: NodeId, port: Option<SwitchPort>) -> Self {
        Self { node, port }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(port) = &self.port {
            port.validate()?;
        }
        Ok(())
    }
}

impl fmt::Display for PortLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.port {
            Some(port) => write!(f, "node={},{}", self.node, port),
            None => write!(f, "node={}", self.node),
        }
    }
}

/// Serialized form of a cost entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCost {
    #[serde(flatten)]
    pub location: PortLocation,
    pub cost: u64,
}

/// Serialized form of a path policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPolicyConfig {
    pub id: u32,
    #[serde(default)]
    pub default_cost: u64,
    #[serde(default)]
    pub costs: Vec<PortCost>,
}

#[derive(Debug, Default)]
struct CostTable {
    default_cost: u64,
    costs: BTreeMap<PortLocation, u64>,
}

/// Link cost policy.
///
/// Lookups take the read lock and never block each other; mutations take
/// the write lock.
#[derive(Debug)]
pub struct CostPolicy {
    id: u32,
    table: RwLock<CostTable>,
}

impl CostPolicy {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            table: RwLock::new(CostTable::default()),
        }
    }

    /// Builds a policy from its serialized form.
    pub fn from_config(config: &PathPolicyConfig) -> Result<Self> {
        let policy = Self::new(config.id);
        policy.replace(config)?;
        Ok(policy)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn default_cost(&self) -> u64 {
        self.table.read().default_cost
    }

    /// Sets the default cost. `COST_UNDEFINED` falls back to intrinsic costs.
    pub fn set_default(&self, cost: u64) -> Option<UpdateKind> {
        let mut table = self.table.write();
        if table.default_cost == cost {
            return None;
        }
        table.default_cost = cost;
        Some(UpdateKind::Changed)
    }

    /// Sets the cost of links leaving ports at `location`.
    pub fn set_cost(&self, location: PortLocation, cost: u64) -> Result<Option<UpdateKind>> {
        check_cost(cost)?;
        location.validate()?;
        let mut table = self.table.write();
        Ok(match table.costs.insert(location, cost) {
            None => Some(UpdateKind::Added),
            Some(old) if old == cost => None,
            Some(_) => Some(UpdateKind::Changed),
        })
    }

    pub fn remove_cost(&self, location: &PortLocation) -> Option<UpdateKind> {
        self.table
            .write()
            .costs
            .remove(location)
            .map(|_| UpdateKind::Removed)
    }

    /// Replaces the whole policy content with `config`.
    ///
    /// The new content is validated before anything is changed.
    #[instrument(skip(self, config), fields(id = self.id))]
    pub fn replace(&self, config: &PathPolicyConfig) -> Result<Option<UpdateKind>> {
        let mut costs = BTreeMap::new();
        for entry in &config.costs {
            check_cost(entry.cost)?;
            entry.location.validate()?;
            costs.insert(entry.location.clone(), entry.cost);
        }

        let mut table = self.table.write();
        if table.default_cost == config.default_cost && table.costs == costs {
            return Ok(None);
        }
        table.default_cost = config.default_cost;
        table.costs = costs;
        debug!("path policy replaced: {} cost entries", table.costs.len());
        Ok(Some(UpdateKind::Changed))
    }

    /// Returns the cost of links leaving `port`.
    ///
    /// Entries are tried from the most specific to the least specific:
    /// type+id+name, type+id, name, then the node wildcard. Without a
    /// match the default cost applies, or `intrinsic` if the default is
    /// undefined.
    pub fn cost(&self, port: &PhysicalPort, name: Option<&str>, intrinsic: u64) -> u64 {
        let table = self.table.read();
        let mut candidates = Vec::with_capacity(4);
        if let Some(name) = name {
            candidates.push(Some(SwitchPort::exact(&port.port_type, &port.id, name)));
        }
        candidates.push(Some(SwitchPort::by_id(&port.port_type, &port.id)));
        if let Some(name) = name {
            candidates.push(Some(SwitchPort::by_name(name)));
        }
        candidates.push(None);

        let found = candidates.into_iter().find_map(|desc| {
            table
                .costs
                .get(&PortLocation::new(port.node.clone(), desc))
                .copied()
        });
        match found {
            Some(cost) => cost,
            None if table.default_cost != COST_UNDEFINED => table.default_cost,
            None => intrinsic,
        }
    }

    /// Serialized form of this policy.
    pub fn to_config(&self) -> PathPolicyConfig {
        let table = self.table.read();
        PathPolicyConfig {
            id: self.id,
            default_cost: table.default_cost,
            costs: table
                .costs
                .iter()
                .map(|(location, cost)| PortCost {
                    location: location.clone(),
                    cost: *cost,
                })
                .collect(),
        }
    }
}

fn check_cost(cost: u64) -> Result<()> {
    if cost == COST_UNDEFINED {
        return Err(VtnError::invalid_config("cost", "must be greater than zero"));
    }
    Ok(())
}

/// The configured path policies.
#[derive(Debug)]
pub struct PathPolicySet {
    intrinsic: Arc<CostPolicy>,
    policies: RwLock<BTreeMap<u32, Arc<CostPolicy>>>,
}

impl Default for PathPolicySet {
    fn default() -> Self {
        Self {
            intrinsic: Arc::new(CostPolicy::new(POLICY_INTRINSIC)),
            policies: RwLock::new(BTreeMap::new()),
        }
    }
}

impl PathPolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_id(id: u32) -> Result<()> {
        if !(1..=POLICY_ID_MAX).contains(&id) {
            return Err(VtnError::invalid_config(
                "path-policy",
                format!("id must be in 1-{}: {}", POLICY_ID_MAX, id),
            ));
        }
        Ok(())
    }

    /// Creates or replaces a policy.
    ///
    /// The lookup and the insertion of a new policy happen under one
    /// write lock, so only one of two concurrent creations reports
    /// `Added`.
    pub fn set(&self, config: &PathPolicyConfig) -> Result<Option<UpdateKind>> {
        Self::check_id(config.id)?;
        let mut policies = self.policies.write();
        match policies.entry(config.id) {
            btree_map::Entry::Occupied(entry) => entry.get().replace(config),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(Arc::new(CostPolicy::from_config(config)?));
                Ok(Some(UpdateKind::Added))
            }
        }
    }

    pub fn remove(&self, id: u32) -> Option<UpdateKind> {
        self.policies
            .write()
            .remove(&id)
            .map(|_| UpdateKind::Removed)
    }

    pub fn get(&self, id: u32) -> Option<Arc<CostPolicy>> {
        self.policies.read().get(&id).cloned()
    }

    /// Policy used for route resolution under `id`. Unknown identifiers
    /// and `POLICY_INTRINSIC` resolve to the intrinsic-only policy.
    pub fn resolve(&self, id: u32) -> Arc<CostPolicy> {
        self.get(id).unwrap_or_else(|| Arc::clone(&self.intrinsic))
    }

    pub fn ids(&self) -> Vec<u32> {
        self.policies.read().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn test_default_and_name_override() {
        let policy = CostPolicy::new(1);
        policy.set_default(100);
        policy
            .set_cost(
                PortLocation::new(node("N1"), Some(SwitchPort::by_name("eth0"))),
                50,
            )
            .unwrap();

        let eth0 = PhysicalPort::new(node("N1"), "OF", "1");
        let eth1 = PhysicalPort::new(node("N1"), "OF", "2");
        assert_eq!(policy.cost(&eth0, Some("eth0"), 7), 50);
        assert_eq!(policy.cost(&eth1, Some("eth1"), 7), 100);
        assert_eq!(policy.cost(&eth1, None, 7), 100);
    }

    #[test]
    fn test_lookup_precedence() {
        let policy = CostPolicy::new(2);
        let n1 = node("openflow:1");
        policy.set_cost(PortLocation::new(n1.clone(), None), 40).unwrap();
        policy
            .set_cost(PortLocation::new(n1.clone(), Some(SwitchPort::by_name("eth1"))), 30)
            .unwrap();
        policy
            .set_cost(PortLocation::new(n1.clone(), Some(SwitchPort::by_id("OF", "1"))), 20)
            .unwrap();
        policy
            .set_cost(
                PortLocation::new(n1.clone(), Some(SwitchPort::exact("OF", "1", "eth1"))),
                10,
            )
            .unwrap();

        let p1 = PhysicalPort::new(n1.clone(), "OF", "1");
        let p2 = PhysicalPort::new(n1.clone(), "OF", "2");
        assert_eq!(policy.cost(&p1, Some("eth1"), 1), 10);
        assert_eq!(policy.cost(&p1, Some("other"), 1), 20);
        assert_eq!(policy.cost(&p2, Some("eth1"), 1), 30);
        assert_eq!(policy.cost(&p2, None, 1), 40);

        let p3 = PhysicalPort::new(node("openflow:2"), "OF", "1");
        assert_eq!(policy.cost(&p3, None, 9), 9);
    }

    #[test]
    fn test_mutation_reports_changes() {
        let policy = CostPolicy::new(1);
        let loc = PortLocation::new(node("N1"), None);
        assert_eq!(policy.set_cost(loc.clone(), 5).unwrap(), Some(UpdateKind::Added));
        assert_eq!(policy.set_cost(loc.clone(), 5).unwrap(), None);
        assert_eq!(policy.set_cost(loc.clone(), 6).unwrap(), Some(UpdateKind::Changed));
        assert!(policy.set_cost(loc.clone(), COST_UNDEFINED).is_err());
        assert_eq!(policy.remove_cost(&loc), Some(UpdateKind::Removed));
        assert_eq!(policy.remove_cost(&loc), None);
        assert_eq!(policy.set_default(0), None);
    }

    #[test]
    fn test_replace_validates_first() {
        let policy = CostPolicy::new(1);
        policy.set_default(10);
        let bad = PathPolicyConfig {
            id: 1,
            default_cost: 20,
            costs: vec![PortCost {
                location: PortLocation::new(node("N1"), None),
                cost: 0,
            }],
        };
        assert!(policy.replace(&bad).is_err());
        assert_eq!(policy.default_cost(), 10);

        let good = PathPolicyConfig {
            costs: vec![PortCost {
                location: PortLocation::new(node("N1"), None),
                cost: 3,
            }],
            ..bad
        };
        assert_eq!(policy.replace(&good).unwrap(), Some(UpdateKind::Changed));
        assert_eq!(policy.replace(&good).unwrap(), None);
        assert_eq!(policy.to_config(), good);
    }

    #[test]
    fn test_policy_set() {
        let set = PathPolicySet::new();
        let config = PathPolicyConfig {
            id: 1,
            default_cost: 100,
            costs: Vec::new(),
        };
        assert_eq!(set.set(&config).unwrap(), Some(UpdateKind::Added));
        assert_eq!(set.resolve(1).default_cost(), 100);
        assert_eq!(set.resolve(2).id(), POLICY_INTRINSIC);
        assert!(set.set(&PathPolicyConfig { id: 4, ..config }).is_err());
        assert_eq!(set.remove(1), Some(UpdateKind::Removed));
        assert_eq!(set.ids(), Vec::<u32>::new());
    }

    #[test]
    fn test_concurrent_creation_added_once() {
        use std::sync::Barrier;
        use std::thread;

        for _ in 0..200 {
            let set = PathPolicySet::new();
            let barrier = Barrier::new(4);
            let added = thread::scope(|scope| {
                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        scope.spawn(|| {
                            barrier.wait();
                            set.set(&PathPolicyConfig {
                                id: 2,
                                default_cost: 10,
                                costs: Vec::new(),
                            })
                            .unwrap()
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap())
                    .filter(|kind| *kind == Some(UpdateKind::Added))
                    .count()
            });
            assert_eq!(added, 1);
        }
    }
}
