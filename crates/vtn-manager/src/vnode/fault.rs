//! Switch pairs a virtual node failed to route between.

use std::collections::BTreeSet;
use vtn_types::NodeId;

/// Set of `(source, destination)` switch pairs without a route.
///
/// A node with a non-empty set is down regardless of its contributors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultedPathSet {
    paths: BTreeSet<(NodeId, NodeId)>,
}

impl FaultedPathSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn contains(&self, source: &NodeId, destination: &NodeId) -> bool {
        self.paths.contains(&(source.clone(), destination.clone()))
    }

    /// Returns true if the pair was not recorded yet.
    pub fn add(&mut self, source: NodeId, destination: NodeId) -> bool {
        self.paths.insert((source, destination))
    }

    /// Removes the pairs `resolved` accepts and returns them.
    pub fn resolve<F>(&mut self, mut resolved: F) -> Vec<(NodeId, NodeId)>
    where
        F: FnMut(&NodeId, &NodeId) -> bool,
    {
        let removed: Vec<(NodeId, NodeId)> = self
            .paths
            .iter()
            .filter(|(src, dst)| resolved(src, dst))
            .cloned()
            .collect();
        for path in &removed {
            self.paths.remove(path);
        }
        removed
    }

    /// Removes the pairs that involve `node`.
    pub fn remove_node(&mut self, node: &NodeId) -> Vec<(NodeId, NodeId)> {
        self.resolve(|src, dst| src == node || dst == node)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(NodeId, NodeId)> {
        self.paths.iter()
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
    fn test_add_and_resolve() {
        let mut faults = FaultedPathSet::new();
        assert!(faults.add(node("openflow:1"), node("openflow:2")));
        assert!(!faults.add(node("openflow:1"), node("openflow:2")));
        assert!(faults.add(node("openflow:3"), node("openflow:2")));
        assert_eq!(faults.len(), 2);

        let removed = faults.resolve(|src, _| *src == node("openflow:1"));
        assert_eq!(removed, vec![(node("openflow:1"), node("openflow:2"))]);
        assert!(faults.contains(&node("openflow:3"), &node("openflow:2")));

        assert_eq!(faults.remove_node(&node("openflow:2")).len(), 1);
        assert!(faults.is_empty());
    }
}
