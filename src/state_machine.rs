//! Rebuild job lifecycle: Idle → Converging(1..=max) → Stable | IterationCapReached
//! → Snapshotting → Done. Any state may fail.

use std::fmt;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

/// All states of one rebuild run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RebuildState {
    Idle,
    /// Phase A pass number, starting at 1.
    Converging(usize),
    Stable,
    IterationCapReached,
    Snapshotting,
    Done,
    Failed,
}

impl fmt::Display for RebuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildState::Idle => write!(f, "Idle"),
            RebuildState::Converging(i) => write!(f, "Converging({i})"),
            RebuildState::Stable => write!(f, "Stable"),
            RebuildState::IterationCapReached => write!(f, "IterationCapReached"),
            RebuildState::Snapshotting => write!(f, "Snapshotting"),
            RebuildState::Done => write!(f, "Done"),
            RebuildState::Failed => write!(f, "Failed"),
        }
    }
}

impl RebuildState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: RebuildState) -> bool {
        matches!(
            (self, next),
            (RebuildState::Idle, RebuildState::Converging(1))
                | (RebuildState::Converging(_), RebuildState::Stable)
                | (RebuildState::Converging(_), RebuildState::IterationCapReached)
                | (RebuildState::Stable, RebuildState::Snapshotting)
                | (RebuildState::IterationCapReached, RebuildState::Snapshotting)
                | (RebuildState::Snapshotting, RebuildState::Done)
                // A finished or failed machine can be reused for another run
                | (RebuildState::Done, RebuildState::Idle)
                | (RebuildState::Failed, RebuildState::Idle)
                | (_, RebuildState::Failed)
        ) || matches!(
            (self, next),
            (RebuildState::Converging(i), RebuildState::Converging(j)) if j == i + 1
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RebuildState::Done | RebuildState::Failed)
    }
}

/// Thread-safe state holder with a watch channel for progress subscribers.
pub struct StateMachine {
    state: RwLock<RebuildState>,
    state_tx: watch::Sender<RebuildState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(RebuildState::Idle);
        Self {
            state: RwLock::new(RebuildState::Idle),
            state_tx,
        }
    }

    pub fn current(&self) -> RebuildState {
        *self.state.read()
    }

    /// Attempt a state transition. Returns Ok(new_state) or Err with reason.
    pub fn transition(&self, next: RebuildState) -> Result<RebuildState, String> {
        let mut state = self.state.write();
        let current = *state;
        if !current.can_transition_to(next) {
            let msg = format!("invalid transition: {} -> {}", current, next);
            warn!("{}", msg);
            return Err(msg);
        }
        *state = next;
        self.state_tx.send_replace(next);
        info!(from = %current, to = %next, "rebuild_state_transition");
        Ok(next)
    }

    /// Force `Failed` from any state.
    pub fn fail(&self) {
        let mut state = self.state.write();
        let prev = *state;
        *state = RebuildState::Failed;
        self.state_tx.send_replace(RebuildState::Failed);
        warn!(from = %prev, "rebuild_failed");
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<RebuildState> {
        self.state_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let sm = StateMachine::new();
        for next in [
            RebuildState::Converging(1),
            RebuildState::Converging(2),
            RebuildState::Stable,
            RebuildState::Snapshotting,
            RebuildState::Done,
        ] {
            sm.transition(next).unwrap();
        }
        assert!(sm.current().is_terminal());
    }

    #[test]
    fn iterations_must_be_consecutive() {
        assert!(!RebuildState::Converging(1).can_transition_to(RebuildState::Converging(3)));
        assert!(!RebuildState::Idle.can_transition_to(RebuildState::Converging(2)));
        assert!(!RebuildState::Idle.can_transition_to(RebuildState::Snapshotting));
        assert!(!RebuildState::Converging(2).can_transition_to(RebuildState::Snapshotting));
    }

    #[test]
    fn invalid_transition_leaves_state_untouched() {
        let sm = StateMachine::new();
        assert!(sm.transition(RebuildState::Done).is_err());
        assert_eq!(sm.current(), RebuildState::Idle);
    }

    #[test]
    fn subscribers_see_latest_state() {
        let sm = StateMachine::new();
        let rx = sm.subscribe();
        sm.transition(RebuildState::Converging(1)).unwrap();
        sm.fail();
        assert_eq!(*rx.borrow(), RebuildState::Failed);
        sm.transition(RebuildState::Idle).unwrap();
        assert_eq!(*rx.borrow(), RebuildState::Idle);
    }
}
