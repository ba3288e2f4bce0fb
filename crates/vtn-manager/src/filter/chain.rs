//! Ordered flow filter chains.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;
use vtn_types::VlanId;

use super::rule::{FilterKind, FilterRule};
use super::signal::{DropReason, PacketSignal, Redirection};
use crate::condition::ConditionEvaluator;
use crate::error::Result;
use crate::event::UpdateKind;
use crate::packet::PacketContext;

/// Direction of a chain relative to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Packets arriving at the owner.
    In,
    /// Packets leaving the owner.
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => write!(f, "in"),
            Self::Out => write!(f, "out"),
        }
    }
}

/// Flow filters of one owner and direction, evaluated by ascending index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterChain {
    /// Tenant that redirect destinations are resolved in.
    tenant: String,
    /// Path of the owner, for logging.
    owner: String,
    direction: Direction,
    rules: BTreeMap<u16, FilterRule>,
}

impl FilterChain {
    pub fn new(tenant: impl Into<String>, owner: impl Into<String>, direction: Direction) -> Self {
        Self {
            tenant: tenant.into(),
            owner: owner.into(),
            direction,
            rules: BTreeMap::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn get(&self, index: u16) -> Option<&FilterRule> {
        self.rules.get(&index)
    }

    pub fn rules(&self) -> impl Iterator<Item = &FilterRule> {
        self.rules.values()
    }

    /// Adds or replaces the rule at `rule.index`.
    pub fn set(&mut self, rule: FilterRule) -> Result<Option<UpdateKind>> {
        rule.validate()?;
        let index = rule.index;
        Ok(match self.rules.insert(index, rule) {
            None => Some(UpdateKind::Added),
            Some(old) if self.rules.get(&index) == Some(&old) => None,
            Some(_) => Some(UpdateKind::Changed),
        })
    }

    pub fn remove(&mut self, index: u16) -> Option<UpdateKind> {
        self.rules.remove(&index).map(|_| UpdateKind::Removed)
    }

    /// Removes every rule. Returns true if the chain was not empty.
    pub fn clear(&mut self) -> bool {
        let changed = !self.rules.is_empty();
        self.rules.clear();
        changed
    }

    /// Evaluates the chain against `ctx`.
    ///
    /// `vlan` overrides the VLAN used for matching. The first matching rule
    /// ends the evaluation: PASS returns `Ok`, DROP and REDIRECT return the
    /// corresponding signal. Rules whose condition is missing, or that do
    /// not support the kind of packet, are skipped.
    pub fn evaluate(
        &self,
        ctx: &mut PacketContext,
        vlan: Option<VlanId>,
        conditions: &dyn ConditionEvaluator,
    ) -> std::result::Result<(), PacketSignal> {
        if self.rules.is_empty() {
            return Ok(());
        }
        ctx.filtered = true;
        if ctx.filter_disabled {
            debug!("{}: flow filter disabled for this packet", self.label());
            return Ok(());
        }
        if let Some(vlan) = vlan {
            ctx.match_vlan = vlan;
        }

        for rule in self.rules.values() {
            let Some(condition) = conditions.condition(&rule.condition) else {
                debug!(
                    "{}.{}: flow condition not found: {}",
                    self.label(),
                    rule.index,
                    rule.condition
                );
                continue;
            };
            if !ctx.is_unicast() && !rule.supports_multicast() {
                debug!("{}.{}: skipped for non-unicast packet", self.label(), rule.index);
                continue;
            }
            if ctx.flooding && !rule.supports_flooding() {
                debug!("{}.{}: skipped for flooded packet", self.label(), rule.index);
                continue;
            }
            if !condition.matches(ctx) {
                continue;
            }

            for action in &rule.actions {
                if action.apply(ctx) {
                    debug!("{}.{}: applied {}", self.label(), rule.index, action);
                } else {
                    debug!("{}.{}: ignored {}", self.label(), rule.index, action);
                }
            }
            return self.terminate(rule);
        }
        Ok(())
    }

    /// Evaluates the chain for one flood destination.
    ///
    /// The packet is copied only if the chain can modify it; an empty chain
    /// hands the shared packet back.
    pub fn evaluate_replica<'a>(
        &self,
        ctx: &'a PacketContext,
        vlan: Option<VlanId>,
        conditions: &dyn ConditionEvaluator,
    ) -> std::result::Result<Cow<'a, PacketContext>, PacketSignal> {
        if self.rules.is_empty() {
            return Ok(Cow::Borrowed(ctx));
        }
        let mut replica = ctx.replica();
        self.evaluate(&mut replica, vlan, conditions)?;
        Ok(Cow::Owned(replica))
    }

    fn terminate(&self, rule: &FilterRule) -> std::result::Result<(), PacketSignal> {
        match &rule.kind {
            FilterKind::Pass => {
                debug!("{}.{}: packet passed", self.label(), rule.index);
                Ok(())
            }
            FilterKind::Drop => {
                debug!("{}.{}: packet discarded", self.label(), rule.index);
                Err(PacketSignal::Drop(DropReason::Filter {
                    owner: self.owner.clone(),
                    index: rule.index,
                }))
            }
            FilterKind::Redirect {
                destination,
                output,
            } => {
                let destination = destination.path(&self.tenant);
                debug!(
                    "{}.{}: packet redirected to {}",
                    self.label(),
                    rule.index,
                    destination
                );
                Err(PacketSignal::Redirect(Redirection {
                    destination,
                    output: *output,
                    filter: format!("{}.{}", self.label(), rule.index),
                }))
            }
        }
    }

    fn label(&self) -> String {
        format!("{}[{}]", self.owner, self.direction)
    }
}
