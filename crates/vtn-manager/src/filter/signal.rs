//! Packet control-flow signals raised by flow filters.
//!
//! A signal ends the processing of the current packet (or of the current
//! flood replica). Signals travel up the pipeline through `?` and are
//! consumed by the redirect handler or by the packet entry point. They are
//! never reported to administrative callers.

use serde::Serialize;
use std::fmt;

use crate::path::InterfacePath;

/// Why a packet was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum DropReason {
    /// A DROP flow filter matched.
    Filter { owner: String, index: u16 },
    /// The redirection limit was exceeded.
    RedirectLoop { hops: u32 },
    /// The redirect destination does not exist.
    DestinationNotFound { destination: InterfacePath },
    /// The redirect destination is disabled.
    DestinationDisabled { destination: InterfacePath },
    /// The interface the packet was mapped to is disabled.
    InterfaceDisabled { interface: InterfacePath },
    /// The packet reached a virtual terminal.
    TerminalSink,
    /// The egress interface has no established port mapping.
    Unmapped { interface: InterfacePath },
    /// No route between the ingress and egress switches.
    NoRoute,
    /// The virtual node disappeared while the packet was processed.
    NodeNotFound,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filter { owner, index } => write!(f, "dropped by flow filter {}.{}", owner, index),
            Self::RedirectLoop { hops } => write!(f, "too many redirections: {}", hops),
            Self::DestinationNotFound { destination } => {
                write!(f, "redirect destination not found: {}", destination)
            }
            Self::DestinationDisabled { destination } => {
                write!(f, "redirect destination disabled: {}", destination)
            }
            Self::InterfaceDisabled { interface } => write!(f, "interface disabled: {}", interface),
            Self::TerminalSink => write!(f, "reached a virtual terminal"),
            Self::Unmapped { interface } => write!(f, "egress not mapped: {}", interface),
            Self::NoRoute => write!(f, "no route"),
            Self::NodeNotFound => write!(f, "virtual node not found"),
        }
    }
}

/// A redirection requested by a REDIRECT flow filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    /// Destination interface in the tenant of the filter.
    pub destination: InterfacePath,
    /// True to send the packet out of the destination, false to make it
    /// arrive there.
    pub output: bool,
    /// Owner and index of the filter, for logging.
    pub filter: String,
}

/// Signal that interrupts packet processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketSignal {
    Drop(DropReason),
    Redirect(Redirection),
}

impl From<DropReason> for PacketSignal {
    fn from(reason: DropReason) -> Self {
        PacketSignal::Drop(reason)
    }
}

impl fmt::Display for PacketSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop(reason) => reason.fmt(f),
            Self::Redirect(r) => write!(
                f,
                "redirected to {} ({}) by {}",
                r.destination,
                if r.output { "out" } else { "in" },
                r.filter
            ),
        }
    }
}
