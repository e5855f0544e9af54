//! Per-instance convergence.
//!
//! Takes one instance from its recorded state to its plan:
//!
//! prepare -> drain + stop -> snapshot -> (detach | update VM) -> DNS ->
//! persistent disk -> apply -> start -> watch -> verify
//!
//! A change-set of only `dns` or only `trusted_certs` takes a short path that
//! leaves the running workload alone. Nothing here retries; a failed step
//! aborts the instance and the error goes back to the rollout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollout_id::{InstanceId, SnapshotId};
use rollout_reconcile::{watch_schedule, ChangeKind, UpdateConfig, WatchRange};
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentClient, JobState, StartOutcome};
use crate::cancel::Cancellation;
use crate::clock::Sleeper;
use crate::collaborators::Collaborators;
use crate::config::{DirectorConfig, StartFailureSeverity};
use crate::disk::DiskCoordinator;
use crate::dns;
use crate::drain::{self, DrainCoordinator, DrainReport};
use crate::error::UpdateError;
use crate::plan::{ApplySpec, InstancePlan, TargetState};
use crate::rollout::Converge;
use crate::store::{InstanceRecord, SnapshotRecord};
use crate::vm::{InstanceContext, VmManager};

/// Ping attempts while waiting for an agent after an in-place network change.
const NETWORK_PING_ATTEMPTS: u32 = 10;

const NETWORK_PING_INTERVAL: Duration = Duration::from_secs(1);

/// What one convergence did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceReport {
    pub instance: InstanceId,
    pub drain: Option<DrainReport>,
    pub vm_recreated: bool,
    /// `start` calls the agent did not support.
    pub tolerated_start_failures: u32,
    pub snapshot_failures: u32,
    /// Job state seen by the last watch poll.
    pub final_state: Option<JobState>,
}

impl ConvergenceReport {
    fn new(instance: InstanceId) -> Self {
        Self {
            instance,
            drain: None,
            vm_recreated: false,
            tolerated_start_failures: 0,
            snapshot_failures: 0,
            final_state: None,
        }
    }
}

/// Converges single instances against the collaborators it was built with.
pub struct InstanceUpdater {
    collab: Collaborators,
    config: DirectorConfig,
    sleeper: Arc<dyn Sleeper>,
    cancel: Cancellation,
}

impl InstanceUpdater {
    pub fn new(
        collab: Collaborators,
        config: DirectorConfig,
        sleeper: Arc<dyn Sleeper>,
        cancel: Cancellation,
    ) -> Self {
        Self {
            collab,
            config,
            sleeper,
            cancel,
        }
    }

    /// Brings one instance to its plan.
    #[instrument(skip(self, plan, update), fields(instance = %plan.label()))]
    pub async fn update(
        &self,
        plan: &InstancePlan,
        update: &UpdateConfig,
        canary: bool,
    ) -> Result<ConvergenceReport, UpdateError> {
        let mut report = ConvergenceReport::new(plan.instance);
        let vms = VmManager::new(
            &self.collab,
            &self.config.deployment,
            self.config.agent_deadlines(),
        );
        let mut ctx = vms.load(self.load_record(plan)?)?;
        let target = plan.desired.target_state;

        if plan.changes.is_only(ChangeKind::Dns) {
            info!("Only DNS records changed");
            self.update_dns(plan).await?;
            return Ok(report);
        }
        if plan.changes.is_only(ChangeKind::TrustedCerts) {
            info!("Only trusted certificates changed");
            self.update_trusted_certs(&ctx, plan).await?;
            return Ok(report);
        }

        let spec = ApplySpec::full(plan, &self.config.deployment);

        if ctx.record.state != TargetState::Detached && ctx.has_vm() {
            debug!("Preparing");
            ctx.agent()?.prepare(&spec).await?;
        }

        report.drain = self.stop(&ctx, plan, update, &spec).await?;
        report.snapshot_failures = self.snapshot(&ctx).await?;

        if target == TargetState::Detached {
            vms.delete(&mut ctx).await?;
            self.collab
                .store
                .set_instance_state(&plan.instance, TargetState::Detached)?;
            info!("Instance detached");
            return Ok(report);
        }

        report.vm_recreated = self.update_vm(&vms, &mut ctx, plan).await?;

        if plan.changes.contains(ChangeKind::Dns) {
            self.update_dns(plan).await?;
        }

        DiskCoordinator::new(&self.collab, &vms)
            .reconcile(&mut ctx, plan)
            .await?;

        let agent = ctx.agent()?;
        agent.apply(&spec).await?;
        self.collab
            .store
            .record_applied_spec(&plan.instance, &spec.hash())?;
        self.collab.templates.clean(&plan.instance).await?;
        self.collab.store.set_instance_state(&plan.instance, target)?;

        if target == TargetState::Started {
            report.tolerated_start_failures = self.start(&ctx, agent.as_ref()).await?;
        }

        report.final_state = self
            .watch(agent.as_ref(), update.watch_range(canary), target)
            .await?;
        self.verify(plan, report.final_state)?;

        if target == TargetState::Started {
            agent
                .run_script("post-start", &serde_json::json!({}))
                .await?;
        }

        info!(
            vm_recreated = report.vm_recreated,
            final_state = ?report.final_state,
            "Instance converged"
        );
        Ok(report)
    }

    /// The stored record, or a fresh one for an instance the director has
    /// not seen before.
    fn load_record(&self, plan: &InstancePlan) -> Result<InstanceRecord, UpdateError> {
        if let Some(record) = self.collab.store.instance(&plan.instance)? {
            return Ok(record);
        }

        let record = InstanceRecord {
            id: plan.instance,
            deployment: self.config.deployment.clone(),
            group: plan.desired.group.clone(),
            index: plan.desired.index,
            availability_zone: plan.desired.availability_zone.clone(),
            state: plan.recorded_state().unwrap_or(TargetState::Stopped),
        };
        self.collab.store.upsert_instance(&record)?;
        debug!("Recorded new instance");
        Ok(record)
    }

    async fn update_dns(&self, plan: &InstancePlan) -> Result<(), UpdateError> {
        let domain = &self.config.dns_domain;
        for network in &plan.desired.networks {
            let names = dns::record_names(
                &plan.desired,
                &plan.instance,
                network,
                &self.config.deployment,
                domain,
            );
            for name in names {
                debug!(record = %name, ip = %network.ip, "Updating DNS record");
                self.collab
                    .dns
                    .upsert_record(domain, &name, &network.ip)
                    .await?;
            }
        }
        self.collab.dns.flush_cache().await?;
        Ok(())
    }

    async fn update_trusted_certs(
        &self,
        ctx: &InstanceContext,
        plan: &InstancePlan,
    ) -> Result<(), UpdateError> {
        let agent = ctx.agent()?;
        agent.update_settings(&plan.desired.trusted_certs).await?;

        let spec = ApplySpec::full(plan, &self.config.deployment);
        agent.apply(&spec).await?;
        self.collab
            .store
            .record_applied_spec(&plan.instance, &spec.hash())?;
        Ok(())
    }

    /// Drains and stops the jobs. Compilation instances and instances without
    /// a VM have nothing to stop.
    async fn stop(
        &self,
        ctx: &InstanceContext,
        plan: &InstancePlan,
        update: &UpdateConfig,
        spec: &ApplySpec,
    ) -> Result<Option<DrainReport>, UpdateError> {
        if plan.desired.compilation || !ctx.has_vm() {
            debug!("Nothing to drain or stop");
            return Ok(None);
        }
        let agent = ctx.agent()?;

        let drained = if ctx.record.state == TargetState::Stopped || plan.flags.skip_drain {
            debug!(recorded = %ctx.record.state, skip_drain = plan.flags.skip_drain, "Skipping drain");
            None
        } else {
            let kind = drain::classify(plan, &update.shutdown_drain_on);
            let report = DrainCoordinator::new(self.sleeper.as_ref(), &self.cancel)
                .drain(&ctx.record.name(), agent.as_ref(), kind, spec)
                .await?;
            Some(report)
        };

        agent.stop().await?;
        Ok(drained)
    }

    /// Takes a clean snapshot of the active disk. Failures are counted, not
    /// raised.
    async fn snapshot(&self, ctx: &InstanceContext) -> Result<u32, UpdateError> {
        let Some(disk) = self.collab.store.active_disk(&ctx.record.id)? else {
            return Ok(0);
        };

        match self.collab.snapshots.snapshot_disk(&disk.cid, true).await {
            Ok(cid) => {
                self.collab.store.insert_snapshot(&SnapshotRecord {
                    id: SnapshotId::new(),
                    disk: disk.id,
                    cid,
                    clean: true,
                    created_at: chrono::Utc::now().timestamp(),
                })?;
                Ok(0)
            }
            Err(e) => {
                warn!(disk = %disk.cid, error = %e, "Snapshot failed, continuing");
                Ok(1)
            }
        }
    }

    /// Updates the VM in place when possible, otherwise recreates it.
    /// Returns whether the VM was recreated.
    async fn update_vm(
        &self,
        vms: &VmManager<'_>,
        ctx: &mut InstanceContext,
        plan: &InstancePlan,
    ) -> Result<bool, UpdateError> {
        if plan.needs_recreate() || !ctx.has_vm() {
            info!(has_vm = ctx.has_vm(), "Recreating VM");
            vms.recreate(ctx, plan, None).await?;
            return Ok(true);
        }
        if !plan.changes.contains(ChangeKind::Network) {
            return Ok(false);
        }

        let vm = ctx.vm()?.cid.clone();
        match self
            .collab
            .networks
            .update(&vm, &plan.desired.networks)
            .await
        {
            Ok(()) => {
                self.settle_network(ctx.agent()?.as_ref()).await?;
                Ok(false)
            }
            Err(e) => {
                warn!(error = %e, "In-place network update failed, recreating VM");
                vms.recreate(ctx, plan, None).await?;
                Ok(true)
            }
        }
    }

    async fn settle_network(&self, agent: &dyn AgentClient) -> Result<(), UpdateError> {
        agent.prepare_network_change().await?;
        self.sleeper.sleep(self.config.network_settle).await;

        let mut attempt = 1;
        loop {
            self.cancel.checkpoint()?;
            match agent.ping().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_timeout() && attempt < NETWORK_PING_ATTEMPTS => {
                    debug!(attempt, "Agent not reachable after network change");
                    attempt += 1;
                    self.sleeper.sleep(NETWORK_PING_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Sends `pre-start` and `start`. Returns the number of tolerated start
    /// failures.
    async fn start(
        &self,
        ctx: &InstanceContext,
        agent: &dyn AgentClient,
    ) -> Result<u32, UpdateError> {
        agent
            .run_script("pre-start", &serde_json::json!({}))
            .await?;

        let outcome = match agent.start().await {
            Ok(outcome) => outcome,
            Err(e) if e.is_unsupported() => StartOutcome::Unsupported,
            Err(e) => return Err(e.into()),
        };

        match outcome {
            StartOutcome::Started => Ok(0),
            StartOutcome::Unsupported => {
                let instance = ctx.record.name();
                match self.config.start_failure_severity {
                    StartFailureSeverity::Warn => {
                        warn!(%instance, "Agent does not support start, ignoring")
                    }
                    StartFailureSeverity::Debug => {
                        debug!(%instance, "Agent does not support start, ignoring")
                    }
                    StartFailureSeverity::Suppress => {}
                }
                Ok(1)
            }
        }
    }

    /// Polls job state along the watch schedule until the target is reached.
    async fn watch(
        &self,
        agent: &dyn AgentClient,
        range: WatchRange,
        target: TargetState,
    ) -> Result<Option<JobState>, UpdateError> {
        let mut observed = None;

        for wait in watch_schedule(range, self.config.watch_intervals) {
            self.sleeper.sleep(wait).await;
            self.cancel.checkpoint()?;

            match agent.get_state().await {
                Ok(state) => {
                    debug!(job_state = %state.job_state, "Watching");
                    observed = Some(state.job_state);
                    if reached(target, state.job_state) {
                        break;
                    }
                }
                Err(e) if e.is_timeout() => {
                    debug!(error = %e, "Agent did not answer, still watching");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(observed)
    }

    fn verify(&self, plan: &InstancePlan, observed: Option<JobState>) -> Result<(), UpdateError> {
        match (plan.desired.target_state, observed) {
            (TargetState::Started, Some(JobState::Running)) => Ok(()),
            (TargetState::Started, observed) => Err(UpdateError::JobNotRunning {
                instance: plan.label(),
                observed: observed.unwrap_or(JobState::Unknown),
            }),
            (TargetState::Stopped, Some(JobState::Running)) => Err(UpdateError::JobNotStopped {
                instance: plan.label(),
            }),
            _ => Ok(()),
        }
    }
}

fn reached(target: TargetState, state: JobState) -> bool {
    match target {
        TargetState::Started => state == JobState::Running,
        TargetState::Stopped | TargetState::Detached => state != JobState::Running,
    }
}

#[async_trait]
impl Converge for InstanceUpdater {
    async fn converge(
        &self,
        plan: &InstancePlan,
        update: &UpdateConfig,
        canary: bool,
    ) -> Result<ConvergenceReport, UpdateError> {
        self.update(plan, update, canary).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::fixtures::plan;
    use crate::sim::{SimFleet, SimSleeper};
    use crate::store::Store;
    use rollout_reconcile::{DrainKind, Quantity};
    use tokio::sync::watch;

    struct Harness {
        fleet: SimFleet,
        store: Arc<Store>,
        sleeper: Arc<SimSleeper>,
        cancel: Cancellation,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                fleet: SimFleet::new(),
                store: Arc::new(Store::open_in_memory().unwrap()),
                sleeper: Arc::new(SimSleeper::new()),
                cancel: Cancellation::never(),
            }
        }

        /// Cancels the task once `sleeps` waits have happened.
        fn cancelled_after(sleeps: usize) -> Self {
            let (tx, rx) = watch::channel(false);
            Self {
                sleeper: Arc::new(SimSleeper::new().cancel_after(sleeps, tx)),
                cancel: Cancellation::new(rx),
                ..Self::new()
            }
        }

        fn seed(&self, p: &InstancePlan) {
            let record = InstanceRecord {
                id: p.instance,
                deployment: "default".into(),
                group: p.desired.group.clone(),
                index: p.desired.index,
                availability_zone: None,
                state: p.recorded_state().unwrap_or(TargetState::Started),
            };
            self.fleet.seed_instance(&self.store, &record, None).unwrap();
        }

        fn updater(&self, config: DirectorConfig) -> InstanceUpdater {
            InstanceUpdater::new(
                self.fleet.collaborators(self.store.clone()),
                config,
                self.sleeper.clone(),
                self.cancel.clone(),
            )
        }
    }

    fn update_config() -> UpdateConfig {
        UpdateConfig::new(
            Quantity::Count(1),
            Quantity::Count(1),
            WatchRange::new(1000, 5000).unwrap(),
            WatchRange::new(1000, 3000).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_watch_stops_once_running() {
        let h = Harness::new();
        let p = plan("web", 0, &[ChangeKind::JobTemplates]);
        h.seed(&p);

        let report = h
            .updater(DirectorConfig::default())
            .update(&p, &update_config(), true)
            .await
            .unwrap();

        assert_eq!(report.final_state, Some(JobState::Running));
        assert_eq!(h.fleet.count("get_state"), 1);
        assert!(!report.vm_recreated);
        assert_eq!(report.drain.map(|d| d.kind), Some(DrainKind::Update));
    }

    #[tokio::test]
    async fn test_watch_stops_at_cancellation() {
        let h = Harness::cancelled_after(2);
        let p = plan("web", 0, &[ChangeKind::JobTemplates]);
        h.seed(&p);
        h.fleet.never_running(p.instance);

        let err = h
            .updater(DirectorConfig::default())
            .update(&p, &update_config(), true)
            .await
            .unwrap_err();

        assert!(err.is_cancellation());
        // One poll after the first wait; the second wait raised the flag.
        assert_eq!(h.fleet.count("get_state"), 1);
        assert_eq!(h.sleeper.slept().len(), 2);
        assert_eq!(h.fleet.count("run_script post-start"), 0);
    }

    #[tokio::test]
    async fn test_watch_polls_through_state_timeouts() {
        let h = Harness::new();
        let p = plan("web", 0, &[ChangeKind::JobTemplates]);
        h.seed(&p);
        h.fleet.time_out_get_state(p.instance, 2);

        let report = h
            .updater(DirectorConfig::default())
            .update(&p, &update_config(), true)
            .await
            .unwrap();

        assert_eq!(report.final_state, Some(JobState::Running));
        assert_eq!(h.fleet.count("get_state"), 3);
        assert_eq!(h.sleeper.slept().len(), 3);
    }

    #[tokio::test]
    async fn test_stopped_target_is_verified() {
        let h = Harness::new();
        let mut p = plan("web", 0, &[ChangeKind::JobTemplates]);
        p.desired.target_state = TargetState::Stopped;
        h.seed(&p);

        let report = h
            .updater(DirectorConfig::default())
            .update(&p, &update_config(), false)
            .await
            .unwrap();

        assert_eq!(report.final_state, Some(JobState::Stopped));
        assert_eq!(h.fleet.count("start"), 0);
        assert_eq!(
            h.store.instance(&p.instance).unwrap().unwrap().state,
            TargetState::Stopped
        );
    }

    #[tokio::test]
    async fn test_suppressed_start_failure_is_still_counted() {
        let h = Harness::new();
        let p = plan("web", 0, &[ChangeKind::JobTemplates]);
        h.seed(&p);
        h.fleet.legacy_agents();
        let config = DirectorConfig {
            start_failure_severity: StartFailureSeverity::Suppress,
            ..DirectorConfig::default()
        };

        let report = h
            .updater(config)
            .update(&p, &update_config(), false)
            .await
            .unwrap();

        assert_eq!(report.tolerated_start_failures, 1);
        assert_eq!(report.final_state, Some(JobState::Running));
    }

    #[tokio::test]
    async fn test_network_change_in_place() {
        let h = Harness::new();
        let p = plan("web", 0, &[ChangeKind::Network]);
        h.seed(&p);
        let config = DirectorConfig::default();
        let settle = config.network_settle;

        let report = h
            .updater(config)
            .update(&p, &update_config(), false)
            .await
            .unwrap();

        assert!(!report.vm_recreated);
        assert_eq!(h.fleet.count("update_network"), 1);
        assert_eq!(h.fleet.count("prepare_network_change"), 1);
        assert_eq!(h.fleet.count("ping"), 1);
        assert!(h.sleeper.slept().contains(&settle));
        assert_eq!(report.drain.map(|d| d.kind), Some(DrainKind::Shutdown));
    }

    #[tokio::test]
    async fn test_failed_network_update_recreates() {
        let h = Harness::new();
        let p = plan("web", 0, &[ChangeKind::Network]);
        h.seed(&p);
        h.fleet.fail_network_updates();

        let report = h
            .updater(DirectorConfig::default())
            .update(&p, &update_config(), false)
            .await
            .unwrap();

        assert!(report.vm_recreated);
        assert_eq!(h.fleet.count("create_vm"), 1);
        assert_eq!(h.fleet.count("prepare_network_change"), 0);
    }

    #[tokio::test]
    async fn test_skip_drain_still_stops() {
        let h = Harness::new();
        let mut p = plan("web", 0, &[ChangeKind::JobTemplates]);
        p.flags.skip_drain = true;
        h.seed(&p);

        let report = h
            .updater(DirectorConfig::default())
            .update(&p, &update_config(), false)
            .await
            .unwrap();

        assert!(report.drain.is_none());
        assert_eq!(h.fleet.count("drain update"), 0);
        assert_eq!(h.fleet.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_new_instance_gets_vm() {
        let h = Harness::new();
        let mut p = plan("web", 4, &[ChangeKind::JobTemplates]);
        p.existing = None;

        let report = h
            .updater(DirectorConfig::default())
            .update(&p, &update_config(), false)
            .await
            .unwrap();

        assert!(report.vm_recreated);
        assert!(report.drain.is_none());
        assert_eq!(h.fleet.count("prepare"), 0);
        assert!(h.store.vm(&p.instance).unwrap().is_some());
        assert_eq!(
            h.store.instance(&p.instance).unwrap().unwrap().state,
            TargetState::Started
        );
    }

    #[test]
    fn test_reached() {
        assert!(reached(TargetState::Started, JobState::Running));
        assert!(!reached(TargetState::Started, JobState::Starting));
        assert!(reached(TargetState::Stopped, JobState::Stopped));
        assert!(!reached(TargetState::Stopped, JobState::Running));
    }
}
