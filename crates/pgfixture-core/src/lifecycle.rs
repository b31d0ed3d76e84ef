use crate::CoreError;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        })
    }
}

/// A failed start goes back to `Stopped`; there is no failed state.
pub fn validate_transition(from: LifecycleState, to: LifecycleState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (
            LifecycleState::Stopped,
            LifecycleState::Starting
        ) | (
            LifecycleState::Starting,
            LifecycleState::Running | LifecycleState::Stopped
        ) | (LifecycleState::Running, LifecycleState::Stopping)
            | (LifecycleState::Stopping, LifecycleState::Stopped)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(LifecycleState::Stopped, LifecycleState::Starting).is_ok());
        assert!(validate_transition(LifecycleState::Starting, LifecycleState::Running).is_ok());
        assert!(validate_transition(LifecycleState::Starting, LifecycleState::Stopped).is_ok()); // failed start
        assert!(validate_transition(LifecycleState::Running, LifecycleState::Stopping).is_ok());
        assert!(validate_transition(LifecycleState::Stopping, LifecycleState::Stopped).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(LifecycleState::Stopped, LifecycleState::Running).is_err());
        assert!(validate_transition(LifecycleState::Running, LifecycleState::Starting).is_err());
        assert!(validate_transition(LifecycleState::Running, LifecycleState::Running).is_err());
        assert!(validate_transition(LifecycleState::Stopping, LifecycleState::Running).is_err());
        assert!(validate_transition(LifecycleState::Stopped, LifecycleState::Stopping).is_err());
    }

    #[test]
    fn state_display() {
        assert_eq!(LifecycleState::Running.to_string(), "running");
        assert_eq!(LifecycleState::Stopping.to_string(), "stopping");
    }
}
