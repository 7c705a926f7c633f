use serde::{Deserialize, Serialize};

/// Lifecycle state of a job as persisted in the resource store.
///
/// Jobs start out `Queued` (the store's default for a freshly created record),
/// move to `Running` when a worker claims them and finish in `Success` or
/// `Failed`. `Stopping` is requested by an external collaborator; the engine
/// only honors it by moving the job to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    #[default]
    Queued,
    Running,
    Success,
    Failed,
    Stopping,
    Stopped,
}

impl JobState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Stopped)
    }

    /// Whether `next` is a legal forward move from `self`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running | Failed | Stopping)
                | (Running, Success | Failed | Stopping)
                | (Stopping, Stopped | Success | Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failed => "FAILED",
            JobState::Stopping => "STOPPING",
            JobState::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobState; 6] = [
        JobState::Queued,
        JobState::Running,
        JobState::Success,
        JobState::Failed,
        JobState::Stopping,
        JobState::Stopped,
    ];

    #[test]
    fn terminal_states() {
        assert!(JobState::Success.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Stopped.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Stopping.is_terminal());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn no_state_is_revisited() {
        for state in ALL {
            assert!(!state.can_transition_to(state));
        }
        assert!(!JobState::Running.can_transition_to(JobState::Queued));
        assert!(!JobState::Stopping.can_transition_to(JobState::Running));
    }

    #[test]
    fn forward_paths() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Success));
        assert!(JobState::Running.can_transition_to(JobState::Failed));
        assert!(JobState::Queued.can_transition_to(JobState::Stopping));
        assert!(JobState::Stopping.can_transition_to(JobState::Stopped));
        assert!(!JobState::Queued.can_transition_to(JobState::Stopped));
    }

    #[test]
    fn serializes_as_screaming_case() {
        let json = serde_json::to_string(&JobState::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
        let state: JobState = serde_json::from_str("\"STOPPING\"").unwrap();
        assert_eq!(state, JobState::Stopping);
        assert_eq!(JobState::Success.to_string(), "SUCCESS");
    }
}
