//! Errors raised while converging an instance.

use thiserror::Error;

use crate::agent::{AgentError, JobState};
use crate::cloud::CloudError;
use crate::store::StoreError;

/// Failure reported by an opaque collaborator (deleter, network updater,
/// snapshotter, template cleaner, DNS).
#[derive(Debug, Clone, Error)]
#[error("{operation} failed: {message}")]
pub struct CollaboratorError {
    pub operation: &'static str,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// Errors that abort the convergence of one instance.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The agent's view of attached disks disagrees with the director's records.
    #[error("`{instance}' has invalid disks: agent reports {reported:?} while director record shows {expected:?}")]
    AgentDiskOutOfSync {
        instance: String,
        reported: Vec<String>,
        expected: Option<String>,
    },

    /// A step needed a VM but the instance has none.
    #[error("`{0}' has no vm")]
    UnexpectedVmAbsence(String),

    /// The task was cancelled by the operator.
    #[error("task cancelled")]
    Cancelled,

    /// The job did not reach `running` within the watch time.
    #[error("`{instance}' is not running after update (job state: {observed})")]
    JobNotRunning { instance: String, observed: JobState },

    /// The job is still running although it was asked to stop.
    #[error("`{instance}' is still running despite the stop command")]
    JobNotStopped { instance: String },

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A convergence task panicked or was aborted.
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl UpdateError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, UpdateError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, UpdateError::Agent(e) if e.is_timeout())
    }

    /// Disk or VM bookkeeping disagrees with what the infrastructure reports.
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            UpdateError::AgentDiskOutOfSync { .. } | UpdateError::UnexpectedVmAbsence(_)
        )
    }

    /// The steps succeeded but the observed job state is not the desired one.
    pub fn is_state_mismatch(&self) -> bool {
        matches!(
            self,
            UpdateError::JobNotRunning { .. } | UpdateError::JobNotStopped { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(UpdateError::Cancelled.is_cancellation());
        assert!(UpdateError::Agent(AgentError::Timeout { method: "get_state" }).is_timeout());
        assert!(!UpdateError::Agent(AgentError::Rpc {
            method: "apply",
            message: "boom".into()
        })
        .is_timeout());
        assert!(UpdateError::UnexpectedVmAbsence("web/0".into()).is_consistency());
        assert!(UpdateError::JobNotStopped {
            instance: "web/0".into()
        }
        .is_state_mismatch());
    }

    #[test]
    fn test_messages() {
        let err = UpdateError::JobNotRunning {
            instance: "web/abc (0)".into(),
            observed: JobState::Failing,
        };
        assert_eq!(
            err.to_string(),
            "`web/abc (0)' is not running after update (job state: failing)"
        );
        let err = UpdateError::from(CollaboratorError::new("dns upsert", "refused"));
        assert_eq!(err.to_string(), "dns upsert failed: refused");
    }
}
