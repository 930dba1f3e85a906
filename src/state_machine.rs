//! Monitor lifecycle: Idle → WarmingUp → Monitoring → Stopped, with Faulted
//! reachable from any running state when acquisition fails.

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MonitorState {
    Idle,
    /// Acquiring, thresholds not yet initialised
    WarmingUp,
    Monitoring,
    Stopped,
    /// Acquisition failed; the rate is frozen
    Faulted,
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorState::Idle => write!(f, "Idle"),
            MonitorState::WarmingUp => write!(f, "WarmingUp"),
            MonitorState::Monitoring => write!(f, "Monitoring"),
            MonitorState::Stopped => write!(f, "Stopped"),
            MonitorState::Faulted => write!(f, "Faulted"),
        }
    }
}

impl MonitorState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: MonitorState) -> bool {
        matches!(
            (self, next),
            (MonitorState::Idle, MonitorState::WarmingUp)
                | (MonitorState::Idle, MonitorState::Stopped)
                | (MonitorState::WarmingUp, MonitorState::Monitoring)
                | (MonitorState::WarmingUp, MonitorState::Stopped)
                | (MonitorState::WarmingUp, MonitorState::Faulted)
                | (MonitorState::Monitoring, MonitorState::Stopped)
                | (MonitorState::Monitoring, MonitorState::Faulted)
                | (MonitorState::Faulted, MonitorState::Stopped)
        )
    }

    pub fn is_running(self) -> bool {
        matches!(self, MonitorState::WarmingUp | MonitorState::Monitoring)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: MonitorState,
    pub to: MonitorState,
}

/// Thread-safe state machine with watch channel for reactive subscribers.
pub struct StateMachine {
    state: RwLock<MonitorState>,
    state_tx: watch::Sender<MonitorState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(MonitorState::Idle);
        Self {
            state: RwLock::new(MonitorState::Idle),
            state_tx,
        }
    }

    /// Current state (non-blocking read).
    pub fn current(&self) -> MonitorState {
        *self.state.read()
    }

    /// Attempt a state transition.
    pub fn transition(&self, next: MonitorState) -> Result<MonitorState, InvalidTransition> {
        let mut state = self.state.write();
        let current = *state;
        if !current.can_transition_to(next) {
            let err = InvalidTransition { from: current, to: next };
            warn!(from = %current, to = %next, "invalid_transition");
            return Err(err);
        }
        *state = next;
        self.state_tx.send_replace(next);
        info!(from = %current, to = %next, "state_transition");
        Ok(next)
    }

    /// Transition only if currently in `from`. Returns whether it happened.
    pub fn advance_from(&self, from: MonitorState, next: MonitorState) -> bool {
        let mut state = self.state.write();
        if *state != from || !from.can_transition_to(next) {
            return false;
        }
        *state = next;
        self.state_tx.send_replace(next);
        info!(from = %from, to = %next, "state_transition");
        true
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.state_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_lifecycle() {
        let sm = StateMachine::new();
        assert_eq!(sm.current(), MonitorState::Idle);
        assert!(!sm.current().is_running());
        sm.transition(MonitorState::WarmingUp).unwrap();
        assert!(sm.current().is_running());
        sm.transition(MonitorState::Monitoring).unwrap();
        assert!(sm.current().is_running());
        sm.transition(MonitorState::Stopped).unwrap();
        assert_eq!(sm.current(), MonitorState::Stopped);
        assert!(!sm.current().is_running());
        assert!(!MonitorState::Faulted.is_running());
    }

    #[test]
    fn test_rejects_invalid_transition() {
        let sm = StateMachine::new();
        let err = sm.transition(MonitorState::Monitoring).unwrap_err();
        assert_eq!(
            err,
            InvalidTransition {
                from: MonitorState::Idle,
                to: MonitorState::Monitoring
            }
        );
        assert_eq!(err.to_string(), "invalid transition: Idle -> Monitoring");
        assert_eq!(sm.current(), MonitorState::Idle);
    }

    #[test]
    fn test_stopped_is_terminal() {
        for next in [
            MonitorState::Idle,
            MonitorState::WarmingUp,
            MonitorState::Monitoring,
            MonitorState::Faulted,
        ] {
            assert!(!MonitorState::Stopped.can_transition_to(next));
        }
    }

    #[test]
    fn test_advance_from_only_matching_state() {
        let sm = StateMachine::new();
        assert!(!sm.advance_from(MonitorState::WarmingUp, MonitorState::Monitoring));
        sm.transition(MonitorState::WarmingUp).unwrap();
        assert!(sm.advance_from(MonitorState::WarmingUp, MonitorState::Monitoring));
        assert!(!sm.advance_from(MonitorState::WarmingUp, MonitorState::Monitoring));
    }

    #[test]
    fn test_subscribers_see_latest() {
        let sm = StateMachine::new();
        let rx = sm.subscribe();
        sm.transition(MonitorState::WarmingUp).unwrap();
        sm.transition(MonitorState::Faulted).unwrap();
        assert_eq!(*rx.borrow(), MonitorState::Faulted);
    }
}
