//! Flow filter rules.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::action::FlowAction;
use crate::error::{Result, VtnError};
use crate::path::{check_name, InterfacePath};

/// Destination of a REDIRECT filter, inside the tenant of the filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RedirectDestination {
    pub node: String,
    pub interface: String,
}

impl RedirectDestination {
    pub fn new(node: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            interface: interface.into(),
        }
    }

    pub fn path(&self, tenant: &str) -> InterfacePath {
        InterfacePath::new(tenant, self.node.clone(), self.interface.clone())
    }
}

/// What a matching filter does with the packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterKind {
    /// Forward the packet.
    Pass,
    /// Discard the packet.
    Drop,
    /// Send the packet to another virtual interface.
    Redirect {
        destination: RedirectDestination,
        /// Transmit from the destination instead of receiving on it.
        #[serde(default)]
        output: bool,
    },
}

impl FilterKind {
    pub fn is_redirect(&self) -> bool {
        matches!(self, Self::Redirect { .. })
    }
}

/// One rule of a flow filter chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Position in the chain, 1-65535.
    pub index: u16,
    /// Name of the flow condition the packet must satisfy.
    pub condition: String,
    pub kind: FilterKind,
    /// Applied in order before `kind` when the rule matches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<FlowAction>,
}

impl FilterRule {
    pub fn new(index: u16, condition: impl Into<String>, kind: FilterKind) -> Self {
        Self {
            index,
            condition: condition.into(),
            kind,
            actions: Vec::new(),
        }
    }

    pub fn pass(index: u16, condition: impl Into<String>) -> Self {
        Self::new(index, condition, FilterKind::Pass)
    }

    pub fn drop(index: u16, condition: impl Into<String>) -> Self {
        Self::new(index, condition, FilterKind::Drop)
    }

    pub fn redirect(
        index: u16,
        condition: impl Into<String>,
        destination: RedirectDestination,
        output: bool,
    ) -> Self {
        Self::new(index, condition, FilterKind::Redirect { destination, output })
    }

    pub fn with_action(mut self, action: FlowAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.index == 0 {
            return Err(VtnError::invalid_config("index", "must be in 1-65535"));
        }
        if self.condition.is_empty() {
            return Err(VtnError::MissingArgument("condition"));
        }
        check_name("flow-condition", &self.condition)?;
        if let FilterKind::Redirect { destination, .. } = &self.kind {
            check_name("vNode", &destination.node)?;
            check_name("vInterface", &destination.interface)?;
        }
        for action in &self.actions {
            action.validate()?;
        }
        Ok(())
    }

    /// Whether the rule applies to broadcast and multicast packets.
    pub fn supports_multicast(&self) -> bool {
        !self.kind.is_redirect()
    }

    /// Whether the rule applies to flood replicas.
    pub fn supports_flooding(&self) -> bool {
        !self.kind.is_redirect()
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "index={}, condition={}, ", self.index, self.condition)?;
        match &self.kind {
            FilterKind::Pass => write!(f, "PASS"),
            FilterKind::Drop => write!(f, "DROP"),
            FilterKind::Redirect { destination, output } => write!(
                f,
                "REDIRECT(destination={}/{}, {})",
                destination.node,
                destination.interface,
                if *output { "out" } else { "in" }
            ),
        }
    }
}
