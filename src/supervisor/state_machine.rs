use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a managed process. Exactly one state holds at a
/// time; the only way to change it is a transition along the edges
/// checked by [`can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(ProcessState, ProcessState),
}

pub fn can_transition(from: ProcessState, to: ProcessState) -> bool {
    use ProcessState::*;
    matches!(
        (from, to),
        (Stopped, Starting)
            | (Starting, Running)
            // exit before ready, or spawn failure rollback
            | (Starting, Stopped)
            // unexpected exit
            | (Running, Stopped)
            | (Starting, Stopping)
            | (Running, Stopping)
            | (Stopping, Stopped)
    )
}

/// Apply a transition, logging it against the owning process name.
pub fn transition(
    name: &str,
    state: &mut ProcessState,
    to: ProcessState,
) -> Result<(), TransitionError> {
    if can_transition(*state, to) {
        tracing::info!("[{}] state transition: {:?} -> {:?}", name, *state, to);
        *state = to;
        Ok(())
    } else {
        Err(TransitionError::InvalidTransition(*state, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProcessState::*;

    #[test]
    fn full_lifecycle_is_valid() {
        let mut state = Stopped;
        assert!(transition("t", &mut state, Starting).is_ok());
        assert!(transition("t", &mut state, Running).is_ok());
        assert!(transition("t", &mut state, Stopping).is_ok());
        assert!(transition("t", &mut state, Stopped).is_ok());
    }

    #[test]
    fn exit_before_ready_settles_to_stopped() {
        let mut state = Starting;
        assert!(transition("t", &mut state, Stopped).is_ok());
        assert_eq!(state, Stopped);
    }

    #[test]
    fn stop_during_startup_is_valid() {
        let mut state = Starting;
        assert!(transition("t", &mut state, Stopping).is_ok());
    }

    #[test]
    fn cannot_skip_starting() {
        let mut state = Stopped;
        let res = transition("t", &mut state, Running);
        assert!(res.is_err());
        assert_eq!(state, Stopped);
    }

    #[test]
    fn cannot_restart_while_stopping() {
        assert!(!can_transition(Stopping, Starting));
        assert!(!can_transition(Stopping, Running));
    }
}
