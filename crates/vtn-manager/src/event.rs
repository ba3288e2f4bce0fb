//! Change notifications emitted by the manager.
//!
//! Events are collected while node locks are held and handed to every
//! registered [`VtnListener`] once the locks are released, so listeners may
//! query the manager from their callbacks.

use serde::Serialize;
use vtn_types::{NodeId, PhysicalPort};

use crate::mapping::MacVlan;
use crate::path::{InterfacePath, NodePath, VlanMapPath};
use crate::state::VnodeState;
use crate::vnode::NodeKind;

/// How a configuration object changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Added,
    Changed,
    Removed,
}

/// A change observed in the virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum VtnEvent {
    TenantChanged {
        tenant: String,
        kind: UpdateKind,
    },
    NodeChanged {
        path: NodePath,
        node_kind: NodeKind,
        kind: UpdateKind,
    },
    NodeStateChanged {
        path: NodePath,
        state: VnodeState,
    },
    InterfaceChanged {
        path: InterfacePath,
        kind: UpdateKind,
    },
    InterfaceStateChanged {
        path: InterfacePath,
        state: VnodeState,
    },
    PortMapChanged {
        path: InterfacePath,
        kind: UpdateKind,
    },
    VlanMapChanged {
        path: VlanMapPath,
        kind: UpdateKind,
    },
    MacMapChanged {
        path: NodePath,
        kind: UpdateKind,
    },
    MacHostActivated {
        path: NodePath,
        host: MacVlan,
        port: PhysicalPort,
    },
    MacHostInactivated {
        path: NodePath,
        host: MacVlan,
        port: PhysicalPort,
    },
    FlowFilterChanged {
        owner: String,
        index: u16,
        kind: UpdateKind,
    },
    FaultPathAdded {
        path: NodePath,
        source: NodeId,
        destination: NodeId,
    },
    FaultPathRemoved {
        path: NodePath,
        source: NodeId,
        destination: NodeId,
    },
    CostPolicyChanged {
        id: u32,
        kind: UpdateKind,
    },
}

/// Receiver of [`VtnEvent`]s.
pub trait VtnListener: Send + Sync {
    fn on_event(&self, event: &VtnEvent);
}
