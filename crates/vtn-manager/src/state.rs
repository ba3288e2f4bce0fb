//! Operational state of virtual nodes and the fold that derives it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Derived operational state of a virtual element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VnodeState {
    /// No contributor has reported anything yet.
    #[default]
    Unknown,
    /// At least one contributor is up and none is down.
    Up,
    /// A contributor is down, or the node has faulted paths.
    Down,
}

impl VnodeState {
    pub const fn is_up(&self) -> bool {
        matches!(self, VnodeState::Up)
    }

    pub const fn is_down(&self) -> bool {
        matches!(self, VnodeState::Down)
    }
}

impl fmt::Display for VnodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VnodeState::Unknown => write!(f, "unknown"),
            VnodeState::Up => write!(f, "up"),
            VnodeState::Down => write!(f, "down"),
        }
    }
}

/// Running fold over the states of a node's contributors.
///
/// A single `Down` contributor makes the result `Down` and ends the fold.
/// `Up` replaces `Unknown` and is never reverted to `Unknown` afterwards.
#[derive(Debug, Clone, Copy)]
pub struct StateFold {
    state: VnodeState,
    done: bool,
}

impl StateFold {
    /// Starts a fold. A node with faulted paths is `Down` before any
    /// contributor is consulted.
    pub fn new(faulted: bool) -> Self {
        if faulted {
            Self {
                state: VnodeState::Down,
                done: true,
            }
        } else {
            Self {
                state: VnodeState::Unknown,
                done: false,
            }
        }
    }

    /// Folds in one contributor. Returns false once the result is final.
    pub fn add(&mut self, contributor: VnodeState) -> bool {
        if self.done {
            return false;
        }
        match (self.state, contributor) {
            (_, VnodeState::Down) => {
                self.state = VnodeState::Down;
                self.done = true;
            }
            (VnodeState::Unknown, VnodeState::Up) => self.state = VnodeState::Up,
            _ => {}
        }
        !self.done
    }

    /// Returns true if no further contributor can change the result.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn finish(self) -> VnodeState {
        self.state
    }
}

/// Folds contributor states lazily; contributors after the first `Down`
/// are never evaluated.
pub fn fold_states<I>(faulted: bool, contributors: I) -> VnodeState
where
    I: IntoIterator<Item = VnodeState>,
{
    let mut fold = StateFold::new(faulted);
    if !fold.is_done() {
        for state in contributors {
            if !fold.add(state) {
                break;
            }
        }
    }
    fold.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use VnodeState::*;

    #[test]
    fn test_empty_fold_is_unknown() {
        assert_eq!(fold_states(false, []), Unknown);
    }

    #[test]
    fn test_faulted_fold_is_down() {
        assert_eq!(fold_states(true, [Up, Up]), Down);
    }

    #[test]
    fn test_any_down_wins_regardless_of_order() {
        let contributors = [Up, Unknown, Down];
        for rotation in 0..contributors.len() {
            let mut ordered = contributors.to_vec();
            ordered.rotate_left(rotation);
            assert_eq!(fold_states(false, ordered), Down);
        }
    }

    #[test]
    fn test_up_is_sticky() {
        assert_eq!(fold_states(false, [Up, Unknown]), Up);
        assert_eq!(fold_states(false, [Unknown, Up, Unknown]), Up);
    }

    #[test]
    fn test_fold_short_circuits() {
        let mut evaluated = 0;
        let state = fold_states(
            false,
            [Up, Down, Up].into_iter().inspect(|_| evaluated += 1),
        );
        assert_eq!(state, Down);
        assert_eq!(evaluated, 2);
    }

    #[test]
    fn test_add_after_done_is_ignored() {
        let mut fold = StateFold::new(false);
        assert!(!fold.add(Down));
        assert!(!fold.add(Up));
        assert_eq!(fold.finish(), Down);
    }
}
