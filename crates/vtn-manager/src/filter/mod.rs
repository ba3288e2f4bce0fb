//! Flow filters: ordered per-owner rule chains and the signals they raise.

mod action;
mod chain;
mod rule;
mod signal;

pub use action::FlowAction;
pub use chain::{Direction, FilterChain};
pub use rule::{FilterKind, FilterRule, RedirectDestination};
pub use signal::{DropReason, PacketSignal, Redirection};
