//! VtnManager - owner of the virtual network tree
//!
//! Structure:
//! ```text
//! tenants (RwLock)
//!   └── Tenant
//!         ├── in_filters (RwLock)
//!         └── nodes (RwLock)
//!               └── VNode (RwLock) ── interfaces, VLAN maps, faults, MAC table
//! registry (DashMap per key) ── port / VLAN / MAC mappings of every node
//! ```
//!
//! Locks are taken in that order: tenant map, node map of a tenant, one
//! node, then the registry. At most one node lock is held at a time.
//! Events are collected while locks are held and dispatched once they are
//! released.

mod forward;
mod physical;
mod resume;
mod tenant;

pub use forward::PacketOutcome;
pub use tenant::{FilterTarget, Tenant};

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::condition::ConditionEvaluator;
use crate::config::VtnConfig;
use crate::cost::PathPolicySet;
use crate::error::{Result, VtnError};
use crate::event::{VtnEvent, VtnListener};
use crate::mapping::{Inactivation, MacMapConfig, MappingRegistry};
use crate::path::NodePath;
use crate::topology::{ConfigPersistence, ForwardingSink, RouteResolver, TopologyOracle};
use crate::vnode::{StateEnv, VNode};

pub(crate) type NodeRef = Arc<RwLock<VNode>>;

/// External services the manager depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub topology: Arc<dyn TopologyOracle>,
    pub routes: Arc<dyn RouteResolver>,
    pub sink: Arc<dyn ForwardingSink>,
    pub conditions: Arc<dyn ConditionEvaluator>,
}

/// The virtual network control plane.
pub struct VtnManager {
    topology: Arc<dyn TopologyOracle>,
    routes: Arc<dyn RouteResolver>,
    sink: Arc<dyn ForwardingSink>,
    conditions: Arc<dyn ConditionEvaluator>,

    registry: MappingRegistry,
    tenants: RwLock<BTreeMap<String, Arc<Tenant>>>,
    policies: PathPolicySet,
    path_policy: RwLock<u32>,
    max_redirections: u32,
    mac_age: Duration,
    mac_table_limit: usize,

    listeners: RwLock<Vec<Arc<dyn VtnListener>>>,
    persistence: RwLock<Option<Arc<dyn ConfigPersistence>>>,

    /// MAC mappings of loaded tenants not claimed yet. `resume` installs
    /// them and keeps the ones that conflict.
    pending_mac_maps: Mutex<BTreeMap<NodePath, MacMapConfig>>,
}

impl VtnManager {
    /// Creates a manager with the packet and routing settings of `config`.
    ///
    /// Tenants in `config` are not loaded; use [`VtnManager::load_tenant`]
    /// and [`VtnManager::resume`].
    pub fn new(config: &VtnConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let policies = PathPolicySet::new();
        for policy in &config.routing.policies {
            policies.set(policy)?;
        }
        info!(
            "VTN manager created: max_redirections={}, path_policy={}",
            config.packet.max_redirections, config.routing.path_policy
        );

        Ok(Self {
            topology: collaborators.topology,
            routes: collaborators.routes,
            sink: collaborators.sink,
            conditions: collaborators.conditions,
            registry: MappingRegistry::new(),
            tenants: RwLock::new(BTreeMap::new()),
            policies,
            path_policy: RwLock::new(config.routing.path_policy),
            max_redirections: config.packet.max_redirections,
            mac_age: config.packet.mac_age(),
            mac_table_limit: config.packet.mac_table_limit,
            listeners: RwLock::new(Vec::new()),
            persistence: RwLock::new(None),
            pending_mac_maps: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn max_redirections(&self) -> u32 {
        self.max_redirections
    }

    /// How long a learned host is kept without being seen.
    pub fn mac_age(&self) -> Duration {
        self.mac_age
    }

    /// The mapping registry shared by every node.
    pub fn registry(&self) -> &MappingRegistry {
        &self.registry
    }

    /// Registers a receiver for change events.
    pub fn add_listener(&self, listener: Arc<dyn VtnListener>) {
        self.listeners.write().push(listener);
    }

    /// Sets where tenant configuration is saved after API changes.
    pub fn set_persistence(&self, persistence: Arc<dyn ConfigPersistence>) {
        *self.persistence.write() = Some(persistence);
    }

    // ---- lookup helpers ----

    pub(crate) fn tenant(&self, name: &str) -> Result<Arc<Tenant>> {
        self.tenants
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| VtnError::not_found("VTN", name))
    }

    pub(crate) fn node(&self, path: &NodePath) -> Result<NodeRef> {
        self.tenant(&path.tenant)?
            .node(&path.node)
            .ok_or_else(|| VtnError::not_found("vNode", path))
    }

    /// Snapshot of every node of every tenant.
    pub(crate) fn all_nodes(&self) -> Vec<NodeRef> {
        let tenants: Vec<Arc<Tenant>> = self.tenants.read().values().cloned().collect();
        tenants.iter().flat_map(|tenant| tenant.node_refs()).collect()
    }

    pub(crate) fn env(&self) -> StateEnv<'_> {
        StateEnv {
            topology: self.topology.as_ref(),
            registry: &self.registry,
        }
    }

    /// Saved MAC mapping of `path` that `resume` could not install yet.
    pub(crate) fn pending_mac_map(&self, path: &NodePath) -> Option<MacMapConfig> {
        self.pending_mac_maps.lock().get(path).cloned()
    }

    /// Forgets saved MAC mappings of nodes selected by `filter`.
    pub(crate) fn discard_pending_mac_maps<F>(&self, filter: F)
    where
        F: Fn(&NodePath) -> bool,
    {
        self.pending_mac_maps.lock().retain(|path, _| !filter(path));
    }

    // ---- state and events ----

    /// Recomputes the state of one node.
    pub(crate) fn refresh_node(&self, path: &NodePath, events: &mut Vec<VtnEvent>) {
        if let Ok(node) = self.node(path) {
            node.write().refresh(self.env(), events);
        }
    }

    /// Recomputes the state of every node.
    pub(crate) fn refresh_all(&self, events: &mut Vec<VtnEvent>) {
        for node in self.all_nodes() {
            node.write().refresh(self.env(), events);
        }
    }

    /// Reports hosts of `node` that are no longer mapped and forgets where
    /// they were learned.
    pub(crate) fn note_inactivation(node: &VNode, inactivation: &Inactivation, events: &mut Vec<VtnEvent>) {
        for (host, port) in &inactivation.hosts {
            if let Some(mac) = host.mac() {
                node.mac_table()
                    .retain(|entry| entry.mac != mac || entry.port_vlan.port != *port);
            }
            events.push(VtnEvent::MacHostInactivated {
                path: node.path().clone(),
                host: *host,
                port: port.clone(),
            });
        }
    }

    /// Applies registry inactivations to the owning nodes. No node lock may
    /// be held by the caller.
    pub(crate) fn apply_inactivations(
        &self,
        inactivations: Vec<(NodePath, Inactivation)>,
        events: &mut Vec<VtnEvent>,
    ) {
        for (owner, inactivation) in inactivations {
            let Ok(node) = self.node(&owner) else {
                debug!("{}: inactivated hosts of a removed node", owner);
                continue;
            };
            let mut node = node.write();
            Self::note_inactivation(&node, &inactivation, events);
            node.refresh(self.env(), events);
        }
    }

    /// Hands events to every listener. No lock may be held by the caller.
    pub(crate) fn dispatch(&self, events: Vec<VtnEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn VtnListener>> = self.listeners.read().clone();
        for event in &events {
            debug!("event: {:?}", event);
            for listener in &listeners {
                listener.on_event(event);
            }
        }
    }

    /// Saves the configuration of `tenant` if persistence is configured.
    pub(crate) fn persist(&self, tenant: &str) {
        let Some(persistence) = self.persistence.read().clone() else {
            return;
        };
        match self.snapshot(tenant) {
            Ok(config) => persistence.save(&config),
            Err(_) => persistence.remove(tenant),
        }
    }
}
