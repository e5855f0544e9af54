//! Task states, stage names and task labels.

use serde::{Deserialize, Serialize};

/// Stage names emitted by the director.
pub mod stages {
    pub const UPDATING_INSTANCE: &str = "Updating instance";
    pub const DELETING_UNNEEDED_INSTANCES: &str = "Deleting unneeded instances";
}

/// State of one task within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Started,
    Finished,
    Failed,
}

impl TaskState {
    /// Progress percentage reported alongside the state.
    pub fn progress(&self) -> u8 {
        match self {
            TaskState::Started => 0,
            TaskState::Finished | TaskState::Failed => 100,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Started)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Started => "started",
            TaskState::Finished => "finished",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Label for an instance task: `group/identity (index)`, suffixed with
/// ` (canary)` for canaries.
pub fn instance_task_label(group: &str, identity: &str, index: u32, canary: bool) -> String {
    if canary {
        format!("{group}/{identity} ({index}) (canary)")
    } else {
        format!("{group}/{identity} ({index})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskState::Finished).unwrap(),
            "\"finished\""
        );
        let parsed: TaskState = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(parsed, TaskState::Failed);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Started.is_terminal());
        assert!(TaskState::Finished.is_terminal());
        assert!(TaskState::Failed.is_terminal());
    }

    #[test]
    fn test_instance_task_label() {
        assert_eq!(instance_task_label("web", "abc", 1, false), "web/abc (1)");
        assert_eq!(
            instance_task_label("web", "abc", 1, true),
            "web/abc (1) (canary)"
        );
    }
}
