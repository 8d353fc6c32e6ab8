//! Firework lifecycle states and the allowed transitions between them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state shared by fireworks and launches.
///
/// Launches only ever use RESERVED, RUNNING, COMPLETED and FIZZLED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FwState {
    Waiting,
    Ready,
    Reserved,
    Running,
    Completed,
    Fizzled,
    Paused,
    Defused,
    Archived,
}

impl FwState {
    pub const ALL: [FwState; 9] = [
        FwState::Waiting,
        FwState::Ready,
        FwState::Reserved,
        FwState::Running,
        FwState::Completed,
        FwState::Fizzled,
        FwState::Paused,
        FwState::Defused,
        FwState::Archived,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FwState::Waiting => "WAITING",
            FwState::Ready => "READY",
            FwState::Reserved => "RESERVED",
            FwState::Running => "RUNNING",
            FwState::Completed => "COMPLETED",
            FwState::Fizzled => "FIZZLED",
            FwState::Paused => "PAUSED",
            FwState::Defused => "DEFUSED",
            FwState::Archived => "ARCHIVED",
        }
    }

    /// A launch is in flight: a worker holds it.
    pub fn is_active(self) -> bool {
        matches!(self, FwState::Reserved | FwState::Running)
    }

    /// The firework has been handed to a worker at least once in its
    /// current incarnation, so its spec is frozen.
    pub fn has_started(self) -> bool {
        matches!(
            self,
            FwState::Reserved | FwState::Running | FwState::Completed | FwState::Fizzled
        )
    }

    /// No further progress without an operator command.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FwState::Completed | FwState::Fizzled | FwState::Defused | FwState::Archived
        )
    }

    /// Whether a firework may move from `self` to `next`.
    ///
    /// Staying in the same state is always allowed and is a no-op.
    pub fn can_transition_to(self, next: FwState) -> bool {
        use FwState::*;

        if self == next {
            return true;
        }
        match self {
            Waiting => matches!(next, Ready | Paused | Defused | Archived),
            Ready => matches!(next, Reserved | Waiting | Paused | Defused | Archived),
            Reserved => matches!(next, Running | Ready | Paused | Defused | Archived),
            Running => matches!(next, Completed | Fizzled | Paused | Defused),
            Completed => matches!(next, Waiting | Archived),
            Fizzled => matches!(next, Waiting | Defused | Archived),
            Paused => matches!(next, Waiting | Defused | Archived),
            Defused => matches!(next, Waiting | Archived),
            Archived => false,
        }
    }
}

impl fmt::Display for FwState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown state name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown firework state '{0}'")]
pub struct UnknownState(pub String);

impl FromStr for FwState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FwState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownState(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_fireworks_state_names() {
        assert_eq!(serde_json::to_value(FwState::Fizzled).unwrap(), "FIZZLED");
        let parsed: FwState = serde_json::from_value("RESERVED".into()).unwrap();
        assert_eq!(parsed, FwState::Reserved);
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("running".parse::<FwState>().unwrap(), FwState::Running);
        assert!("EXPLODED".parse::<FwState>().is_err());
    }

    #[test]
    fn archived_is_a_sink() {
        for next in FwState::ALL {
            if next != FwState::Archived {
                assert!(!FwState::Archived.can_transition_to(next), "ARCHIVED -> {next}");
            }
        }
    }

    #[test]
    fn running_cannot_skip_back_to_ready() {
        assert!(!FwState::Running.can_transition_to(FwState::Ready));
        assert!(!FwState::Running.can_transition_to(FwState::Archived));
        assert!(FwState::Running.can_transition_to(FwState::Defused));
    }

    #[test]
    fn rerun_paths_lead_to_waiting() {
        assert!(FwState::Fizzled.can_transition_to(FwState::Waiting));
        assert!(FwState::Completed.can_transition_to(FwState::Waiting));
        assert!(!FwState::Waiting.can_transition_to(FwState::Completed));
    }
}
