//! Drain protocol: lets a workload finish in-flight work before its jobs
//! are stopped.
//!
//! The agent answers a drain request with a signed number of seconds. A
//! non-negative answer is a fixed wait. A negative answer means "not done
//! yet": wait `abs(answer)` and ask again with a `status` drain, until a
//! non-negative answer arrives and is waited out.

use std::time::Duration;

use rollout_reconcile::{ChangeSet, DrainKind};
use tracing::{debug, info, warn};

use crate::agent::AgentClient;
use crate::cancel::Cancellation;
use crate::clock::Sleeper;
use crate::error::UpdateError;
use crate::plan::{ApplySpec, InstancePlan, TargetState};

/// Picks the drain kind for a plan.
///
/// `shutdown` when the instance stops, loses its VM, or changes a category in
/// `shutdown_on`; `update` for configuration-only restarts.
pub fn classify(plan: &InstancePlan, shutdown_on: &ChangeSet) -> DrainKind {
    let stopping = matches!(
        plan.desired.target_state,
        TargetState::Stopped | TargetState::Detached
    );

    if stopping || plan.needs_recreate() || plan.changes.intersects(shutdown_on) {
        DrainKind::Shutdown
    } else {
        DrainKind::Update
    }
}

/// What a completed drain did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub kind: DrainKind,
    /// Number of `status` polls sent.
    pub polls: u32,
    /// Total time slept.
    pub waited: Duration,
}

/// Runs the drain protocol against one agent.
pub struct DrainCoordinator<'a> {
    sleeper: &'a dyn Sleeper,
    cancel: &'a Cancellation,
}

impl<'a> DrainCoordinator<'a> {
    pub fn new(sleeper: &'a dyn Sleeper, cancel: &'a Cancellation) -> Self {
        Self { sleeper, cancel }
    }

    /// Drains the instance and waits as long as the workload asks.
    ///
    /// A dynamic drain is only bounded by cancellation, which is checked
    /// before and after every wait. Timeouts on `status` polls are treated as
    /// "still draining".
    pub async fn drain(
        &self,
        instance: &str,
        agent: &dyn AgentClient,
        kind: DrainKind,
        spec: &ApplySpec,
    ) -> Result<DrainReport, UpdateError> {
        let mut report = DrainReport {
            kind,
            polls: 0,
            waited: Duration::ZERO,
        };

        let mut answer = agent.drain(kind, Some(spec)).await?;
        debug!(instance, kind = %kind, drain_secs = answer.secs(), "Drain requested");

        loop {
            self.cancel.checkpoint()?;

            let step = answer.step();
            let wait = step.duration();
            if !wait.is_zero() {
                if step.is_final() {
                    info!(instance, wait_secs = wait.as_secs(), "Waiting for drain");
                } else {
                    info!(instance, wait_secs = wait.as_secs(), "Draining, checking back later");
                }
                self.sleeper.sleep(wait).await;
                report.waited += wait;
            }

            if step.is_final() {
                break;
            }

            self.cancel.checkpoint()?;
            report.polls += 1;
            match agent.drain(DrainKind::Status, None).await {
                Ok(next) => answer = next,
                Err(e) if e.is_timeout() => {
                    warn!(instance, error = %e, "Drain status timed out, polling again");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }
}
