//! Remote agent interface.
//!
//! Every VM runs an agent that the director drives over RPC. Calls are
//! synchronous from the engine's point of view and bounded by a timeout;
//! a timeout is reported separately from an application-level failure so
//! polling loops can treat it as "not yet".

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollout_id::{AgentId, DiskCid};
use rollout_reconcile::{DrainKind, DrainTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::ApplySpec;

/// Errors from agent calls.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// The agent did not answer in time.
    #[error("timed out waiting for agent reply to {method}")]
    Timeout { method: &'static str },

    /// The agent answered with an error.
    #[error("agent call {method} failed: {message}")]
    Rpc {
        method: &'static str,
        message: String,
    },

    /// The agent does not know this call.
    #[error("agent does not support {method}")]
    Unsupported { method: &'static str },
}

impl AgentError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentError::Timeout { .. })
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, AgentError::Unsupported { .. })
    }
}

/// Run state of the jobs on a VM as reported by its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Starting,
    Stopped,
    Failing,
    #[serde(other)]
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Starting => "starting",
            JobState::Stopped => "stopped",
            JobState::Failing => "failing",
            JobState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply to `get_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub job_state: JobState,
}

/// Result of asking an agent to start its jobs.
///
/// Older agents do not implement `start`; that is a named outcome the caller
/// tolerates rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    Unsupported,
}

/// RPC surface of one agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Lets the workload pre-validate the new spec before it is disrupted.
    async fn prepare(&self, spec: &ApplySpec) -> Result<(), AgentError>;

    /// `spec` is `None` for `status` polls.
    async fn drain(&self, kind: DrainKind, spec: Option<&ApplySpec>)
        -> Result<DrainTime, AgentError>;

    async fn stop(&self) -> Result<(), AgentError>;

    async fn start(&self) -> Result<StartOutcome, AgentError>;

    async fn get_state(&self) -> Result<AgentState, AgentError>;

    async fn list_disk(&self) -> Result<Vec<DiskCid>, AgentError>;

    async fn mount_disk(&self, disk: &DiskCid) -> Result<(), AgentError>;

    async fn unmount_disk(&self, disk: &DiskCid) -> Result<(), AgentError>;

    async fn migrate_disk(&self, from: &DiskCid, to: &DiskCid) -> Result<(), AgentError>;

    async fn apply(&self, spec: &ApplySpec) -> Result<(), AgentError>;

    async fn run_script(&self, name: &str, options: &serde_json::Value) -> Result<(), AgentError>;

    async fn update_settings(&self, trusted_certs: &str) -> Result<(), AgentError>;

    async fn prepare_network_change(&self) -> Result<(), AgentError>;

    async fn ping(&self) -> Result<(), AgentError>;
}

/// Hands out the agent handle of a VM.
pub trait AgentConnector: Send + Sync {
    fn connect(&self, agent: &AgentId) -> Arc<dyn AgentClient>;
}

/// Deadlines applied to agent calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentDeadlines {
    /// State queries, pings and other quick calls.
    pub call: Duration,
    /// Calls that move data or run operator code: `prepare`, `drain`,
    /// `stop`, `run_script` and `migrate_disk`.
    pub long_running: Duration,
}

impl AgentDeadlines {
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            call: timeout,
            long_running: timeout,
        }
    }
}

/// Applies per-method deadlines to another agent client.
pub struct TimedAgent {
    inner: Arc<dyn AgentClient>,
    deadlines: AgentDeadlines,
}

impl TimedAgent {
    pub fn new(inner: Arc<dyn AgentClient>, deadlines: AgentDeadlines) -> Self {
        Self { inner, deadlines }
    }

    async fn call<T, F>(&self, method: &'static str, fut: F) -> Result<T, AgentError>
    where
        F: Future<Output = Result<T, AgentError>> + Send,
    {
        bounded(method, self.deadlines.call, fut).await
    }

    async fn long<T, F>(&self, method: &'static str, fut: F) -> Result<T, AgentError>
    where
        F: Future<Output = Result<T, AgentError>> + Send,
    {
        bounded(method, self.deadlines.long_running, fut).await
    }
}

async fn bounded<T, F>(method: &'static str, deadline: Duration, fut: F) -> Result<T, AgentError>
where
    F: Future<Output = Result<T, AgentError>> + Send,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Timeout { method }),
    }
}

#[async_trait]
impl AgentClient for TimedAgent {
    async fn prepare(&self, spec: &ApplySpec) -> Result<(), AgentError> {
        self.long("prepare", self.inner.prepare(spec)).await
    }

    async fn drain(
        &self,
        kind: DrainKind,
        spec: Option<&ApplySpec>,
    ) -> Result<DrainTime, AgentError> {
        self.long("drain", self.inner.drain(kind, spec)).await
    }

    async fn stop(&self) -> Result<(), AgentError> {
        self.long("stop", self.inner.stop()).await
    }

    async fn start(&self) -> Result<StartOutcome, AgentError> {
        self.call("start", self.inner.start()).await
    }

    async fn get_state(&self) -> Result<AgentState, AgentError> {
        self.call("get_state", self.inner.get_state()).await
    }

    async fn list_disk(&self) -> Result<Vec<DiskCid>, AgentError> {
        self.call("list_disk", self.inner.list_disk()).await
    }

    async fn mount_disk(&self, disk: &DiskCid) -> Result<(), AgentError> {
        self.call("mount_disk", self.inner.mount_disk(disk)).await
    }

    async fn unmount_disk(&self, disk: &DiskCid) -> Result<(), AgentError> {
        self.call("unmount_disk", self.inner.unmount_disk(disk)).await
    }

    async fn migrate_disk(&self, from: &DiskCid, to: &DiskCid) -> Result<(), AgentError> {
        self.long("migrate_disk", self.inner.migrate_disk(from, to))
            .await
    }

    async fn apply(&self, spec: &ApplySpec) -> Result<(), AgentError> {
        self.call("apply", self.inner.apply(spec)).await
    }

    async fn run_script(&self, name: &str, options: &serde_json::Value) -> Result<(), AgentError> {
        self.long("run_script", self.inner.run_script(name, options))
            .await
    }

    async fn update_settings(&self, trusted_certs: &str) -> Result<(), AgentError> {
        self.call("update_settings", self.inner.update_settings(trusted_certs))
            .await
    }

    async fn prepare_network_change(&self) -> Result<(), AgentError> {
        self.call(
            "prepare_network_change",
            self.inner.prepare_network_change(),
        )
        .await
    }

    async fn ping(&self) -> Result<(), AgentError> {
        self.call("ping", self.inner.ping()).await
    }
}
