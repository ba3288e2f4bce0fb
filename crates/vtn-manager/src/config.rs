//! Configuration file support for vtnd.
//!
//! Loads and validates the manager configuration from TOML. The tenant
//! sections use the same types as [`crate::VtnManager::snapshot`], so a
//! saved snapshot can be fed back through `load_tenant` and `resume`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::condition::FlowCondition;
use crate::cost::{PathPolicyConfig, PathPolicySet, POLICY_ID_MAX};
use crate::error::{VtnError, Result as VtnResult};
use crate::filter::FilterRule;
use crate::mapping::{MacMapConfig, NodeVlan, PortMapConfig};
use crate::path::check_name;
use crate::topology::TopologyConfig;
use crate::vnode::{NodeKind, DEFAULT_MAC_TABLE_LIMIT};

/// Smallest accepted `packet.max_redirections`.
pub const MIN_REDIRECTIONS: u32 = 10;

/// Largest accepted `packet.max_redirections`.
pub const MAX_REDIRECTIONS: u32 = 100_000;

/// Accepted range of `packet.mac_age_interval`, in seconds.
pub const MAC_AGE_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 10..=1_000_000;

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Invalid(#[from] VtnError),
}

/// Result type alias for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Packet processing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketConfig {
    /// Redirections allowed for one packet before it is dropped
    #[serde(default = "default_max_redirections")]
    pub max_redirections: u32,

    /// Seconds a learned host stays in a bridge's MAC table without
    /// being seen
    #[serde(default = "default_mac_age_interval")]
    pub mac_age_interval: u64,

    /// Hosts one bridge learns at most
    #[serde(default = "default_mac_table_limit")]
    pub mac_table_limit: usize,
}

impl PacketConfig {
    pub fn mac_age(&self) -> Duration {
        Duration::from_secs(self.mac_age_interval)
    }
}

/// Routing configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Path policy used for route resolution, 0 for intrinsic costs only
    #[serde(default)]
    pub path_policy: u32,

    /// Configured path policies
    #[serde(default)]
    pub policies: Vec<PathPolicyConfig>,
}

/// Virtual interface configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VInterfaceConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_map: Option<PortMapConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub in_filters: Vec<FilterRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out_filters: Vec<FilterRule>,
}

impl VInterfaceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            description: None,
            port_map: None,
            in_filters: Vec::new(),
            out_filters: Vec::new(),
        }
    }
}

/// Virtual bridge or terminal configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VNodeConfig {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<VInterfaceConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vlan_maps: Vec<NodeVlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_map: Option<MacMapConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub in_filters: Vec<FilterRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out_filters: Vec<FilterRule>,
}

impl VNodeConfig {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            interfaces: Vec::new(),
            vlan_maps: Vec::new(),
            mac_map: None,
            in_filters: Vec::new(),
            out_filters: Vec::new(),
        }
    }

    fn validate(&self, tenant: &str) -> VtnResult<()> {
        check_name(self.kind.label(), &self.name)?;
        let mut names = BTreeSet::new();
        for iface in &self.interfaces {
            check_name("vInterface", &iface.name)?;
            if !names.insert(iface.name.as_str()) {
                return Err(VtnError::already_exists(
                    "vInterface",
                    format!("{}/{}/{}", tenant, self.name, iface.name),
                ));
            }
            if let Some(port_map) = &iface.port_map {
                port_map.validate()?;
            }
            validate_rules(&iface.in_filters)?;
            validate_rules(&iface.out_filters)?;
        }

        if self.kind == NodeKind::Terminal
            && (self.interfaces.len() > 1
                || !self.vlan_maps.is_empty()
                || self.mac_map.is_some()
                || !self.in_filters.is_empty()
                || !self.out_filters.is_empty())
        {
            return Err(VtnError::invalid_config(
                "vTerminal",
                format!(
                    "{}/{}: only one interface and no mappings or node filters allowed",
                    tenant, self.name
                ),
            ));
        }

        let mut keys = BTreeSet::new();
        for key in &self.vlan_maps {
            if !keys.insert(key) {
                return Err(VtnError::already_exists("VLAN mapping", key));
            }
        }
        if let Some(host) = self
            .mac_map
            .as_ref()
            .and_then(|m| m.denied().hosts().find(|h| h.is_wildcard()).copied())
        {
            return Err(VtnError::invalid_config(
                "denied-hosts",
                format!("MAC address must be specified: {}", host),
            ));
        }
        validate_rules(&self.in_filters)?;
        validate_rules(&self.out_filters)
    }
}

/// Tenant configuration, also the unit of persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub in_filters: Vec<FilterRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<VNodeConfig>,
}

impl TenantConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            in_filters: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn validate(&self) -> VtnResult<()> {
        check_name("VTN", &self.name)?;
        validate_rules(&self.in_filters)?;
        let mut names = BTreeSet::new();
        for node in &self.nodes {
            node.validate(&self.name)?;
            if !names.insert(node.name.as_str()) {
                return Err(VtnError::already_exists(
                    "vNode",
                    format!("{}/{}", self.name, node.name),
                ));
            }
        }
        Ok(())
    }
}

fn validate_rules(rules: &[FilterRule]) -> VtnResult<()> {
    let mut indices = BTreeSet::new();
    for rule in rules {
        rule.validate()?;
        if !indices.insert(rule.index) {
            return Err(VtnError::already_exists("flow-filter", rule.index));
        }
    }
    Ok(())
}

/// Complete vtnd configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VtnConfig {
    /// Packet processing configuration
    #[serde(default)]
    pub packet: PacketConfig,

    /// Routing configuration
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Physical topology for the in-memory topology
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<TopologyConfig>,

    /// Flow conditions referenced by flow filters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<FlowCondition>,

    /// Tenants restored at startup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tenants: Vec<TenantConfig>,
}

// Default functions
fn default_max_redirections() -> u32 {
    100
}

fn default_mac_age_interval() -> u64 {
    600
}

fn default_mac_table_limit() -> usize {
    DEFAULT_MAC_TABLE_LIMIT
}

fn default_enabled() -> bool {
    true
}

fn default_kind() -> NodeKind {
    NodeKind::Bridge
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            max_redirections: default_max_redirections(),
            mac_age_interval: default_mac_age_interval(),
            mac_table_limit: default_mac_table_limit(),
        }
    }
}

impl VtnConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> VtnResult<()> {
        if !(MIN_REDIRECTIONS..=MAX_REDIRECTIONS).contains(&self.packet.max_redirections) {
            return Err(VtnError::invalid_config(
                "packet.max_redirections",
                format!(
                    "must be in {}-{}: {}",
                    MIN_REDIRECTIONS, MAX_REDIRECTIONS, self.packet.max_redirections
                ),
            ));
        }

        if !MAC_AGE_INTERVAL_RANGE.contains(&self.packet.mac_age_interval) {
            return Err(VtnError::invalid_config(
                "packet.mac_age_interval",
                format!(
                    "must be in {}-{}: {}",
                    MAC_AGE_INTERVAL_RANGE.start(),
                    MAC_AGE_INTERVAL_RANGE.end(),
                    self.packet.mac_age_interval
                ),
            ));
        }
        if self.packet.mac_table_limit == 0 {
            return Err(VtnError::invalid_config(
                "packet.mac_table_limit",
                "must be greater than zero",
            ));
        }

        if self.routing.path_policy > POLICY_ID_MAX {
            return Err(VtnError::invalid_config(
                "routing.path_policy",
                format!("must be in 0-{}", POLICY_ID_MAX),
            ));
        }
        let mut ids = BTreeSet::new();
        for policy in &self.routing.policies {
            PathPolicySet::check_id(policy.id)?;
            if !ids.insert(policy.id) {
                return Err(VtnError::already_exists("path-policy", policy.id));
            }
        }

        if let Some(topology) = &self.topology {
            topology.validate()?;
        }
        for condition in &self.conditions {
            condition.validate()?;
        }

        let mut names = BTreeSet::new();
        for tenant in &self.tenants {
            tenant.validate()?;
            if !names.insert(tenant.name.as_str()) {
                return Err(VtnError::already_exists("VTN", &tenant.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = VtnConfig::default();
        assert_eq!(config.packet.max_redirections, 100);
        assert_eq!(config.routing.path_policy, 0);
        assert!(config.topology.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = VtnConfig::parse(
            r#"
            [packet]
            max_redirections = 10

            [routing]
            path_policy = 1

            [[routing.policies]]
            id = 1
            default_cost = 100
            costs = [{ node = "openflow:1", port = { name = "eth0" }, cost = 50 }]

            [[conditions]]
            name = "C1"
            matches = [{ index = 1, dl_src = "00:11:22:33:44:55" }]

            [[tenants]]
            name = "vtn1"

            [[tenants.nodes]]
            name = "bridge1"
            vlan_maps = [{ vlan = 10 }]
            in_filters = [{ index = 10, condition = "C1", kind = "drop" }]

            [[tenants.nodes.interfaces]]
            name = "if1"
            port_map = { node = "openflow:1", port = { name = "eth1" } }

            [[tenants.nodes]]
            name = "term1"
            kind = "terminal"
            interfaces = [{ name = "if1", enabled = false }]
            "#,
        )
        .unwrap();

        assert_eq!(config.packet.max_redirections, 10);
        assert_eq!(config.routing.policies[0].costs[0].cost, 50);
        let tenant = &config.tenants[0];
        assert_eq!(tenant.nodes.len(), 2);
        assert_eq!(tenant.nodes[0].kind, NodeKind::Bridge);
        assert_eq!(tenant.nodes[0].vlan_maps[0].map_id(), "ANY.10");
        assert_eq!(tenant.nodes[0].in_filters[0].kind, FilterKind::Drop);
        assert_eq!(tenant.nodes[1].kind, NodeKind::Terminal);
        assert!(!tenant.nodes[1].interfaces[0].enabled);
    }

    #[test]
    fn test_validation_errors() {
        assert!(VtnConfig::parse("[packet]\nmax_redirections = 9\n").is_err());
        assert!(VtnConfig::parse("[packet]\nmax_redirections = 100001\n").is_err());
        assert!(VtnConfig::parse("[packet]\nmac_age_interval = 9\n").is_err());
        assert!(VtnConfig::parse("[packet]\nmac_table_limit = 0\n").is_err());
        assert!(VtnConfig::parse("[routing]\npath_policy = 4\n").is_err());
        assert!(VtnConfig::parse("[[routing.policies]]\nid = 0\n").is_err());
        assert!(matches!(
            VtnConfig::parse("packet = 5"),
            Err(ConfigError::Parse(_))
        ));

        let mut tenant = TenantConfig::new("vtn1");
        let mut term = VNodeConfig::new("term1", NodeKind::Terminal);
        term.interfaces.push(VInterfaceConfig::new("if1"));
        term.interfaces.push(VInterfaceConfig::new("if2"));
        tenant.nodes.push(term);
        assert!(tenant.validate().is_err());

        let mut tenant = TenantConfig::new("vtn1");
        tenant.nodes.push(VNodeConfig::new("bridge1", NodeKind::Bridge));
        tenant.nodes.push(VNodeConfig::new("bridge1", NodeKind::Bridge));
        assert!(matches!(
            tenant.validate(),
            Err(VtnError::AlreadyExists { kind: "vNode", .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = VtnConfig::load("/nonexistent/vtnd.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
