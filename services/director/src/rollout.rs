//! Fleet rollout: canary-gated convergence of one instance group.
//!
//! Unneeded instances are deleted first. The changed plans are then split
//! into canaries and bulk. Canaries run to completion before any bulk work
//! starts, and a single canary failure halts the group. Bulk work runs one
//! availability zone at a time; once any instance fails, no further bulk
//! work is started and in-flight work is allowed to finish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rollout_events::stages;
use rollout_id::InstanceId;
use rollout_reconcile::{group_by_zone, partition_canaries, UpdateConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::cancel::Cancellation;
use crate::collaborators::InstanceDeleter;
use crate::error::UpdateError;
use crate::instance_updater::ConvergenceReport;
use crate::plan::InstancePlan;
use crate::progress::{ProgressReporter, Stage};

/// Brings one instance to its plan.
#[async_trait]
pub trait Converge: Send + Sync {
    async fn converge(
        &self,
        plan: &InstancePlan,
        update: &UpdateConfig,
        canary: bool,
    ) -> Result<ConvergenceReport, UpdateError>;
}

/// One instance group as handed over by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRollout {
    pub name: String,
    pub update: UpdateConfig,
    pub plans: Vec<InstancePlan>,
    /// Instances of this group that are no longer desired.
    #[serde(default)]
    pub unneeded: Vec<InstanceId>,
}

/// An instance that did not converge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFailure {
    pub instance: InstanceId,
    pub label: String,
    pub message: String,
}

/// What a rollout did, successful or not.
#[derive(Debug, Clone, Default)]
pub struct RolloutReport {
    pub group: String,
    pub converged: Vec<ConvergenceReport>,
    /// Plans with an empty change-set; never handed to the converger.
    pub skipped_noops: usize,
    pub deleted: Vec<InstanceId>,
    pub deletion_failures: Vec<InstanceFailure>,
}

/// A halted rollout. `first` is the first error recorded; `failures` holds
/// every instance that failed, `first` included.
#[derive(Debug, Error)]
#[error("instance group `{group}' failed: {first}")]
pub struct RolloutError {
    pub group: String,
    #[source]
    pub first: UpdateError,
    pub failures: Vec<InstanceFailure>,
    pub report: RolloutReport,
}

/// A changed plan with its position in the stage.
struct Work {
    plan: InstancePlan,
    index: u32,
}

enum WorkResult {
    Converged(ConvergenceReport),
    Failed {
        instance: InstanceId,
        label: String,
        error: UpdateError,
    },
    /// Not started because the group had already halted.
    Skipped,
}

/// Errors gathered across the phases of one rollout.
#[derive(Default)]
struct Failures {
    first: Option<UpdateError>,
    all: Vec<InstanceFailure>,
}

impl Failures {
    fn record(&mut self, instance: InstanceId, label: String, error: UpdateError) {
        self.all.push(InstanceFailure {
            instance,
            label,
            message: error.to_string(),
        });
        if self.first.is_none() {
            self.first = Some(error);
        }
    }

    fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

/// Runs instance groups through the canary and bulk phases.
pub struct RolloutScheduler {
    converger: Arc<dyn Converge>,
    deleter: Arc<dyn InstanceDeleter>,
    progress: Arc<ProgressReporter>,
    cancel: Cancellation,
}

impl RolloutScheduler {
    pub fn new(
        converger: Arc<dyn Converge>,
        deleter: Arc<dyn InstanceDeleter>,
        progress: Arc<ProgressReporter>,
    ) -> Self {
        Self {
            converger,
            deleter,
            progress,
            cancel: Cancellation::never(),
        }
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Rolls out one instance group.
    #[instrument(skip(self, group), fields(group = %group.name, task = %self.progress.task_id()))]
    pub async fn run(&self, group: GroupRollout) -> Result<RolloutReport, RolloutError> {
        let GroupRollout {
            name,
            update,
            plans,
            unneeded,
        } = group;
        let mut report = RolloutReport {
            group: name.clone(),
            ..RolloutReport::default()
        };

        if !unneeded.is_empty() {
            self.delete_unneeded(&name, &update, unneeded, &mut report)
                .await;
        }

        let group_size = plans.len();
        let (changed, noops): (Vec<_>, Vec<_>) = plans.into_iter().partition(|p| !p.is_noop());
        report.skipped_noops = noops.len();
        if changed.is_empty() {
            info!(noops = report.skipped_noops, "No instances to update");
            return Ok(report);
        }

        let total = changed.len();
        let canaries = update.canaries.resolve(group_size).min(total);
        let max_in_flight = update.max_in_flight_for(group_size);
        info!(total, canaries, max_in_flight, "Updating instance group");

        let work: Vec<Work> = changed
            .into_iter()
            .zip(1u32..)
            .map(|(plan, index)| Work { plan, index })
            .collect();
        let (canary_work, bulk_work) = partition_canaries(work, canaries);

        let stage = self
            .progress
            .stage(stages::UPDATING_INSTANCE, vec![name.clone()], total as u32);
        let update = Arc::new(update);
        let halted = Arc::new(AtomicBool::new(false));
        let mut failures = Failures::default();

        if !canary_work.is_empty() {
            self.run_batch(
                &stage,
                &update,
                canary_work,
                max_in_flight,
                true,
                &halted,
                &mut report,
                &mut failures,
            )
            .await;
            if !failures.is_empty() {
                warn!(failed = failures.all.len(), "Canary failed, halting");
                return Err(rollout_error(name, failures, report));
            }
        }

        for zone in group_by_zone(bulk_work, |w| w.plan.desired.availability_zone.as_deref()) {
            if halted.load(Ordering::SeqCst) {
                break;
            }
            self.run_batch(
                &stage,
                &update,
                zone,
                max_in_flight,
                false,
                &halted,
                &mut report,
                &mut failures,
            )
            .await;
        }

        if !failures.is_empty() {
            return Err(rollout_error(name, failures, report));
        }

        info!(converged = report.converged.len(), "Instance group updated");
        Ok(report)
    }

    /// Converges `batch` with at most `max_in_flight` instances at a time and
    /// waits for every started task.
    #[allow(clippy::too_many_arguments)]
    async fn run_batch(
        &self,
        stage: &Stage,
        update: &Arc<UpdateConfig>,
        batch: Vec<Work>,
        max_in_flight: usize,
        canary: bool,
        halted: &Arc<AtomicBool>,
        report: &mut RolloutReport,
        failures: &mut Failures,
    ) {
        let semaphore = Arc::new(Semaphore::new(max_in_flight));
        let mut tasks = JoinSet::new();
        // Instance and label of every task that has not reported back yet.
        let mut pending: HashMap<task::Id, (InstanceId, String)> = HashMap::new();

        for Work { plan, index } in batch {
            let label = plan.task_label(canary);
            let owner = (plan.instance, label.clone());

            let semaphore = Arc::clone(&semaphore);
            let converger = Arc::clone(&self.converger);
            let update = Arc::clone(update);
            let halted = Arc::clone(halted);
            let stage = stage.clone();
            let cancel = self.cancel.clone();

            let handle = tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return WorkResult::Skipped;
                };
                if halted.load(Ordering::SeqCst) {
                    debug!(instance = %label, "Group halted, not starting");
                    return WorkResult::Skipped;
                }

                stage.started(&label, index);
                let result = match cancel.checkpoint() {
                    Ok(()) => converger.converge(&plan, &update, canary).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(converged) => {
                        stage.finished(&label, index);
                        WorkResult::Converged(converged)
                    }
                    Err(error) => {
                        halted.store(true, Ordering::SeqCst);
                        error!(instance = %label, error = %error, "Instance update failed");
                        stage.failed(&label, index, &error);
                        WorkResult::Failed {
                            instance: plan.instance,
                            label,
                            error,
                        }
                    }
                }
            });
            pending.insert(handle.id(), owner);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, result)) => {
                    pending.remove(&id);
                    match result {
                        WorkResult::Converged(converged) => report.converged.push(converged),
                        WorkResult::Failed {
                            instance,
                            label,
                            error,
                        } => failures.record(instance, label, error),
                        WorkResult::Skipped => {}
                    }
                }
                Err(e) => {
                    halted.store(true, Ordering::SeqCst);
                    match pending.remove(&e.id()) {
                        Some((instance, label)) => {
                            error!(instance = %label, error = %e, "Update task did not complete");
                            failures.record(instance, label, UpdateError::Worker(e.to_string()));
                        }
                        None => error!(error = %e, "Unknown update task did not complete"),
                    }
                }
            }
        }
    }

    /// Deletes instances that are no longer desired. Failures are reported
    /// but never halt the rollout.
    async fn delete_unneeded(
        &self,
        group: &str,
        update: &UpdateConfig,
        unneeded: Vec<InstanceId>,
        report: &mut RolloutReport,
    ) {
        let total = unneeded.len();
        let max_in_flight = update.max_in_flight_for(total);
        info!(total, max_in_flight, "Deleting unneeded instances");

        let stage = self.progress.stage(
            stages::DELETING_UNNEEDED_INSTANCES,
            vec![group.to_string()],
            total as u32,
        );
        let semaphore = Arc::new(Semaphore::new(max_in_flight));
        let mut tasks = JoinSet::new();
        let mut pending: HashMap<task::Id, (InstanceId, String)> = HashMap::new();

        for (instance, index) in unneeded.into_iter().zip(1u32..) {
            let label = format!("{group}/{}", instance.label());
            let owner = (instance, label.clone());
            let semaphore = Arc::clone(&semaphore);
            let deleter = Arc::clone(&self.deleter);
            let stage = stage.clone();

            let handle = tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                stage.started(&label, index);
                let result = deleter.delete(&instance).await;
                match &result {
                    Ok(()) => stage.finished(&label, index),
                    Err(e) => {
                        warn!(instance = %label, error = %e, "Failed to delete unneeded instance");
                        stage.failed(&label, index, e);
                    }
                }
                result
            });
            pending.insert(handle.id(), owner);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result.map_err(|e| e.to_string())),
                Err(e) => {
                    warn!(error = %e, "Delete task did not complete");
                    (e.id(), Err(e.to_string()))
                }
            };
            let Some((instance, label)) = pending.remove(&id) else {
                continue;
            };
            match result {
                Ok(()) => report.deleted.push(instance),
                Err(message) => report.deletion_failures.push(InstanceFailure {
                    instance,
                    label,
                    message,
                }),
            }
        }
    }
}

fn rollout_error(group: String, failures: Failures, report: RolloutReport) -> RolloutError {
    let Failures { first, all } = failures;
    RolloutError {
        group,
        first: first.unwrap_or_else(|| UpdateError::Worker("no error recorded".to_string())),
        failures: all,
        report,
    }
}
