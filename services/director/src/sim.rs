//! In-process simulation of a cloud, its agents and the opaque collaborators.
//!
//! Used by the `director` binary to run plan files without infrastructure and
//! by tests to script failures. Every externally visible call is appended to
//! a call log that tests assert against.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rollout_id::{AgentId, DiskCid, DiskId, InstanceId, SnapshotCid, VmCid};
use rollout_reconcile::{DrainKind, DrainTime};
use tokio::sync::watch;
use tracing::debug;

use crate::agent::{AgentClient, AgentConnector, AgentError, AgentState, JobState, StartOutcome};
use crate::clock::Sleeper;
use crate::cloud::{Cloud, CloudError, CreatedVm, VmRequest};
use crate::collaborators::{
    CloudVmLifecycle, Collaborators, NetworkUpdater, Snapshotter, TemplateCleaner,
};
use crate::dns::DnsPublisher;
use crate::error::CollaboratorError;
use crate::plan::{ApplySpec, NetworkSettings};
use crate::store::{DiskRecord, InstanceRecord, Store, StoreError, VmRecord};

/// One call observed by the simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCall {
    /// Instance the call concerned, when it can be attributed.
    pub instance: Option<InstanceId>,
    pub op: String,
}

struct SimVm {
    instance: InstanceId,
    agent: AgentId,
}

struct SimAgentState {
    instance: InstanceId,
    job_state: JobState,
    mounted: Vec<DiskCid>,
}

#[derive(Default)]
struct Faults {
    create_vm_failures: VecDeque<CloudError>,
    attach_failures: VecDeque<CloudError>,
    fail_prepare: BTreeSet<InstanceId>,
    fail_migrate: BTreeSet<InstanceId>,
    never_running: BTreeSet<InstanceId>,
    forget_disks: BTreeSet<InstanceId>,
    phantom_disks: BTreeSet<InstanceId>,
    drain_answers: BTreeMap<InstanceId, VecDeque<i64>>,
    status_timeouts: BTreeMap<InstanceId, u32>,
    state_timeouts: BTreeMap<InstanceId, u32>,
    network_update_fails: bool,
    start_unsupported: bool,
    list_disk_unsupported: bool,
    snapshots_fail: bool,
}

#[derive(Default)]
struct FleetState {
    vms: BTreeMap<VmCid, SimVm>,
    agents: BTreeMap<AgentId, SimAgentState>,
    /// Every known disk and the VM it is attached to.
    disks: BTreeMap<DiskCid, Option<VmCid>>,
    dns: BTreeMap<String, String>,
    dns_flushes: u32,
    calls: Vec<SimCall>,
    vm_requests: Vec<VmRequest>,
    faults: Faults,
}

impl FleetState {
    fn log(&mut self, instance: Option<InstanceId>, op: impl Into<String>) {
        let op = op.into();
        debug!(instance = ?instance.map(|i| i.to_string()), op = %op, "sim call");
        self.calls.push(SimCall { instance, op });
    }

    fn instance_of_vm(&self, vm: &VmCid) -> Option<InstanceId> {
        self.vms.get(vm).map(|v| v.instance)
    }

    fn agent_of(&self, instance: &InstanceId) -> Option<&SimAgentState> {
        self.agents.values().find(|a| a.instance == *instance)
    }
}

/// A simulated fleet. Clones share state.
#[derive(Clone, Default)]
pub struct SimFleet {
    state: Arc<Mutex<FleetState>>,
    next: Arc<AtomicU64>,
}

impl SimFleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_handle(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Wires every collaborator to this fleet.
    pub fn collaborators(&self, store: Arc<Store>) -> Collaborators {
        let cloud: Arc<dyn Cloud> = Arc::new(self.clone());
        Collaborators {
            store,
            vms: Arc::new(CloudVmLifecycle::new(cloud.clone())),
            cloud,
            agents: Arc::new(self.clone()),
            networks: Arc::new(self.clone()),
            snapshots: Arc::new(self.clone()),
            templates: Arc::new(self.clone()),
            dns: Arc::new(self.clone()),
        }
    }

    /// Creates a running VM for an existing instance and records it, with an
    /// attached and mounted active disk when `disk_size_mb` is given. Nothing
    /// is added to the call log.
    pub fn seed_instance(
        &self,
        store: &Store,
        record: &InstanceRecord,
        disk_size_mb: Option<u64>,
    ) -> Result<VmRecord, StoreError> {
        let vm = VmRecord {
            cid: VmCid::new(self.next_handle("vm")).map_err(invalid)?,
            agent_id: AgentId::new(self.next_handle("agent")).map_err(invalid)?,
            applied_spec: None,
        };
        let disk = match disk_size_mb {
            Some(size_mb) => Some(DiskRecord {
                id: DiskId::new(),
                instance: record.id,
                cid: DiskCid::new(self.next_handle("disk")).map_err(invalid)?,
                size_mb,
                cloud_properties: serde_json::Value::Null,
                active: true,
            }),
            None => None,
        };

        {
            let mut state = self.state();
            state.vms.insert(
                vm.cid.clone(),
                SimVm {
                    instance: record.id,
                    agent: vm.agent_id.clone(),
                },
            );
            state.agents.insert(
                vm.agent_id.clone(),
                SimAgentState {
                    instance: record.id,
                    job_state: JobState::Running,
                    mounted: disk.iter().map(|d| d.cid.clone()).collect(),
                },
            );
            if let Some(disk) = &disk {
                state.disks.insert(disk.cid.clone(), Some(vm.cid.clone()));
            }
        }

        store.upsert_instance(record)?;
        store.set_vm(&record.id, &vm)?;
        if let Some(disk) = &disk {
            store.insert_disk(disk)?;
        }
        Ok(vm)
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    pub fn fail_next_create_vm(&self, error: CloudError) {
        self.state().faults.create_vm_failures.push_back(error);
    }

    pub fn fail_next_attach(&self, error: CloudError) {
        self.state().faults.attach_failures.push_back(error);
    }

    pub fn fail_prepare(&self, instance: InstanceId) {
        self.state().faults.fail_prepare.insert(instance);
    }

    pub fn fail_migrate(&self, instance: InstanceId) {
        self.state().faults.fail_migrate.insert(instance);
    }

    /// The instance's jobs report `failing` after every start.
    pub fn never_running(&self, instance: InstanceId) {
        self.state().faults.never_running.insert(instance);
    }

    /// The instance's agent reports no disks.
    pub fn forget_disks(&self, instance: InstanceId) {
        self.state().faults.forget_disks.insert(instance);
    }

    /// The instance's agent reports an extra disk the director never created.
    pub fn phantom_disk(&self, instance: InstanceId) {
        self.state().faults.phantom_disks.insert(instance);
    }

    /// Detaches a disk without the director knowing, as a provider-side
    /// incident would.
    pub fn detach_behind_director(&self, vm: &VmCid, disk: &DiskCid) {
        let mut guard = self.state();
        let state = &mut *guard;
        if let Some(slot) = state.disks.get_mut(disk) {
            *slot = None;
        }
        if let Some(agent) = state.vms.get(vm).map(|v| v.agent.clone()) {
            if let Some(agent) = state.agents.get_mut(&agent) {
                agent.mounted.retain(|d| d != disk);
            }
        }
    }

    /// Drain answers in order; the last one repeats forever.
    pub fn script_drain(&self, instance: InstanceId, answers: Vec<i64>) {
        self.state()
            .faults
            .drain_answers
            .insert(instance, answers.into());
    }

    /// The next `count` drain status polls time out.
    pub fn time_out_status(&self, instance: InstanceId, count: u32) {
        self.state().faults.status_timeouts.insert(instance, count);
    }

    /// The next `count` job state queries time out.
    pub fn time_out_get_state(&self, instance: InstanceId, count: u32) {
        self.state().faults.state_timeouts.insert(instance, count);
    }

    pub fn fail_network_updates(&self) {
        self.state().faults.network_update_fails = true;
    }

    /// Agents behave like old agents without `start` or `list_disk`.
    pub fn legacy_agents(&self) {
        let mut state = self.state();
        state.faults.start_unsupported = true;
        state.faults.list_disk_unsupported = true;
    }

    pub fn fail_snapshots(&self) {
        self.state().faults.snapshots_fail = true;
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<SimCall> {
        self.state().calls.clone()
    }

    /// Operation names logged for one instance, in order.
    pub fn calls_for(&self, instance: &InstanceId) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.instance.as_ref() == Some(instance))
            .map(|c| c.op.clone())
            .collect()
    }

    /// Every VM creation request, failed attempts included.
    pub fn vm_requests(&self) -> Vec<VmRequest> {
        self.state().vm_requests.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn dns_records(&self) -> BTreeMap<String, String> {
        self.state().dns.clone()
    }

    pub fn dns_flushes(&self) -> u32 {
        self.state().dns_flushes
    }

    /// Disks the instance's agent has mounted.
    pub fn mounted_disks(&self, instance: &InstanceId) -> Vec<DiskCid> {
        self.state()
            .agent_of(instance)
            .map(|a| a.mounted.clone())
            .unwrap_or_default()
    }

    /// The VM a disk is attached to, if any.
    pub fn attachment(&self, disk: &DiskCid) -> Option<VmCid> {
        self.state().disks.get(disk).cloned().flatten()
    }

    pub fn job_state(&self, instance: &InstanceId) -> Option<JobState> {
        self.state().agent_of(instance).map(|a| a.job_state)
    }

    pub fn vm_count(&self) -> usize {
        self.state().vms.len()
    }
}

fn invalid(e: rollout_id::IdError) -> StoreError {
    StoreError::Invalid(e.to_string())
}

fn sim_error(method: &'static str, message: &str) -> CloudError {
    CloudError::Other {
        method,
        message: message.to_string(),
    }
}

// =============================================================================
// Cloud
// =============================================================================

#[async_trait]
impl Cloud for SimFleet {
    async fn create_disk(
        &self,
        size_mb: u64,
        _cloud_properties: &serde_json::Value,
        vm: Option<&VmCid>,
    ) -> Result<DiskCid, CloudError> {
        let cid = DiskCid::new(self.next_handle("disk"))
            .map_err(|e| sim_error("create_disk", &e.to_string()))?;
        let mut state = self.state();
        let instance = vm.and_then(|v| state.instance_of_vm(v));
        state.log(instance, format!("create_disk {size_mb}"));
        state.disks.insert(cid.clone(), None);
        Ok(cid)
    }

    async fn attach_disk(&self, vm: &VmCid, disk: &DiskCid) -> Result<(), CloudError> {
        let mut state = self.state();
        let instance = state.instance_of_vm(vm);
        state.log(instance, "attach_disk");

        if let Some(err) = state.faults.attach_failures.pop_front() {
            return Err(err);
        }
        if !state.vms.contains_key(vm) {
            return Err(CloudError::VmNotFound(vm.clone()));
        }
        match state.disks.get(disk) {
            None => return Err(CloudError::DiskNotFound(disk.clone())),
            Some(Some(other)) if other != vm => {
                return Err(sim_error(
                    "attach_disk",
                    &format!("disk {disk} is attached to {other}"),
                ));
            }
            Some(_) => {}
        }
        state.disks.insert(disk.clone(), Some(vm.clone()));
        Ok(())
    }

    async fn detach_disk(&self, vm: &VmCid, disk: &DiskCid) -> Result<(), CloudError> {
        let mut guard = self.state();
        let state = &mut *guard;
        let instance = state.instance_of_vm(vm);
        state.log(instance, "detach_disk");

        match state.disks.get_mut(disk) {
            None => Err(CloudError::DiskNotFound(disk.clone())),
            Some(slot) if slot.as_ref() != Some(vm) => {
                Err(CloudError::DiskNotAttached(disk.clone()))
            }
            Some(slot) => {
                *slot = None;
                if let Some(agent) = state.vms.get(vm).map(|v| v.agent.clone()) {
                    if let Some(agent) = state.agents.get_mut(&agent) {
                        agent.mounted.retain(|d| d != disk);
                    }
                }
                Ok(())
            }
        }
    }

    async fn delete_vm(&self, vm: &VmCid) -> Result<(), CloudError> {
        let mut state = self.state();
        let instance = state.instance_of_vm(vm);
        state.log(instance, "delete_vm");

        if !state.vms.contains_key(vm) {
            return Err(CloudError::VmNotFound(vm.clone()));
        }
        if let Some((disk, _)) = state.disks.iter().find(|(_, slot)| slot.as_ref() == Some(vm)) {
            return Err(sim_error(
                "delete_vm",
                &format!("disk {disk} is still attached"),
            ));
        }
        if let Some(removed) = state.vms.remove(vm) {
            state.agents.remove(&removed.agent);
        }
        Ok(())
    }

    async fn create_vm(&self, request: &VmRequest) -> Result<CreatedVm, CloudError> {
        let cid = VmCid::new(self.next_handle("vm"))
            .map_err(|e| sim_error("create_vm", &e.to_string()))?;
        let agent_id = AgentId::new(self.next_handle("agent"))
            .map_err(|e| sim_error("create_vm", &e.to_string()))?;

        let mut state = self.state();
        state.log(Some(request.instance), "create_vm");
        state.vm_requests.push(request.clone());
        if let Some(err) = state.faults.create_vm_failures.pop_front() {
            return Err(err);
        }

        // Disks only guide placement; the director attaches them itself.
        if let Some(missing) = request.disks.iter().find(|d| !state.disks.contains_key(*d)) {
            return Err(CloudError::DiskNotFound(missing.clone()));
        }
        state.vms.insert(
            cid.clone(),
            SimVm {
                instance: request.instance,
                agent: agent_id.clone(),
            },
        );
        state.agents.insert(
            agent_id.clone(),
            SimAgentState {
                instance: request.instance,
                job_state: JobState::Stopped,
                mounted: Vec::new(),
            },
        );

        Ok(CreatedVm { cid, agent_id })
    }
}

// =============================================================================
// Agents
// =============================================================================

impl AgentConnector for SimFleet {
    fn connect(&self, agent: &AgentId) -> Arc<dyn AgentClient> {
        Arc::new(SimAgent {
            id: agent.clone(),
            fleet: self.clone(),
        })
    }
}

/// Handle to one simulated agent.
struct SimAgent {
    id: AgentId,
    fleet: SimFleet,
}

impl SimAgent {
    /// Logs the call and runs `f` against the agent's state. An agent whose
    /// VM is gone never answers, which surfaces as a timeout.
    fn with<T>(
        &self,
        method: &'static str,
        op: impl Into<String>,
        f: impl FnOnce(&mut Faults, &mut SimAgentState) -> Result<T, AgentError>,
    ) -> Result<T, AgentError> {
        let mut guard = self.fleet.state();
        let state = &mut *guard;
        let instance = state.agents.get(&self.id).map(|a| a.instance);
        state.log(instance, op);
        match state.agents.get_mut(&self.id) {
            Some(agent) => f(&mut state.faults, agent),
            None => Err(AgentError::Timeout { method }),
        }
    }
}

fn rpc_error(method: &'static str, message: &str) -> AgentError {
    AgentError::Rpc {
        method,
        message: message.to_string(),
    }
}

#[async_trait]
impl AgentClient for SimAgent {
    async fn prepare(&self, _spec: &ApplySpec) -> Result<(), AgentError> {
        self.with("prepare", "prepare", |faults, agent| {
            if faults.fail_prepare.contains(&agent.instance) {
                return Err(rpc_error("prepare", "package compilation failed"));
            }
            Ok(())
        })
    }

    async fn drain(
        &self,
        kind: DrainKind,
        _spec: Option<&ApplySpec>,
    ) -> Result<DrainTime, AgentError> {
        self.with("drain", format!("drain {kind}"), |faults, agent| {
            if kind == DrainKind::Status {
                if let Some(remaining) = faults.status_timeouts.get_mut(&agent.instance) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(AgentError::Timeout { method: "drain" });
                    }
                }
            }
            let secs = match faults.drain_answers.get_mut(&agent.instance) {
                Some(answers) if answers.len() > 1 => answers.pop_front().unwrap_or(0),
                Some(answers) => answers.front().copied().unwrap_or(0),
                None => 0,
            };
            Ok(DrainTime::from_secs(secs))
        })
    }

    async fn stop(&self) -> Result<(), AgentError> {
        self.with("stop", "stop", |_, agent| {
            agent.job_state = JobState::Stopped;
            Ok(())
        })
    }

    async fn start(&self) -> Result<StartOutcome, AgentError> {
        self.with("start", "start", |faults, agent| {
            if faults.start_unsupported {
                return Ok(StartOutcome::Unsupported);
            }
            agent.job_state = if faults.never_running.contains(&agent.instance) {
                JobState::Failing
            } else {
                JobState::Running
            };
            Ok(StartOutcome::Started)
        })
    }

    async fn get_state(&self) -> Result<AgentState, AgentError> {
        self.with("get_state", "get_state", |faults, agent| {
            if let Some(remaining) = faults.state_timeouts.get_mut(&agent.instance) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(AgentError::Timeout { method: "get_state" });
                }
            }
            Ok(AgentState {
                job_state: agent.job_state,
            })
        })
    }

    async fn list_disk(&self) -> Result<Vec<DiskCid>, AgentError> {
        self.with("list_disk", "list_disk", |faults, agent| {
            if faults.list_disk_unsupported {
                return Err(AgentError::Unsupported { method: "list_disk" });
            }
            if faults.forget_disks.contains(&agent.instance) {
                return Ok(Vec::new());
            }
            let mut disks = agent.mounted.clone();
            if faults.phantom_disks.contains(&agent.instance) {
                disks.push(
                    DiskCid::new("disk-phantom")
                        .map_err(|e| rpc_error("list_disk", &e.to_string()))?,
                );
            }
            Ok(disks)
        })
    }

    async fn mount_disk(&self, disk: &DiskCid) -> Result<(), AgentError> {
        self.with("mount_disk", "mount_disk", |_, agent| {
            if !agent.mounted.contains(disk) {
                agent.mounted.push(disk.clone());
            }
            Ok(())
        })
    }

    async fn unmount_disk(&self, disk: &DiskCid) -> Result<(), AgentError> {
        self.with("unmount_disk", "unmount_disk", |_, agent| {
            agent.mounted.retain(|d| d != disk);
            Ok(())
        })
    }

    async fn migrate_disk(&self, _from: &DiskCid, _to: &DiskCid) -> Result<(), AgentError> {
        self.with("migrate_disk", "migrate_disk", |faults, agent| {
            if faults.fail_migrate.contains(&agent.instance) {
                return Err(rpc_error("migrate_disk", "copy interrupted"));
            }
            Ok(())
        })
    }

    async fn apply(&self, _spec: &ApplySpec) -> Result<(), AgentError> {
        self.with("apply", "apply", |faults, agent| {
            // Agents without `start` bring jobs up on apply.
            if faults.start_unsupported && !faults.never_running.contains(&agent.instance) {
                agent.job_state = JobState::Running;
            }
            Ok(())
        })
    }

    async fn run_script(&self, name: &str, _options: &serde_json::Value) -> Result<(), AgentError> {
        self.with("run_script", format!("run_script {name}"), |_, _| Ok(()))
    }

    async fn update_settings(&self, _trusted_certs: &str) -> Result<(), AgentError> {
        self.with("update_settings", "update_settings", |_, _| Ok(()))
    }

    async fn prepare_network_change(&self) -> Result<(), AgentError> {
        self.with("prepare_network_change", "prepare_network_change", |_, _| {
            Ok(())
        })
    }

    async fn ping(&self) -> Result<(), AgentError> {
        self.with("ping", "ping", |_, _| Ok(()))
    }
}

// =============================================================================
// Collaborators
// =============================================================================

#[async_trait]
impl NetworkUpdater for SimFleet {
    async fn update(
        &self,
        vm: &VmCid,
        _networks: &[NetworkSettings],
    ) -> Result<(), CollaboratorError> {
        let mut state = self.state();
        let instance = state.instance_of_vm(vm);
        state.log(instance, "update_network");
        if state.faults.network_update_fails {
            return Err(CollaboratorError::new(
                "network update",
                "in-place reconfiguration not supported",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Snapshotter for SimFleet {
    async fn snapshot_disk(
        &self,
        disk: &DiskCid,
        _clean: bool,
    ) -> Result<SnapshotCid, CollaboratorError> {
        let cid = self.next_handle("snap");
        let mut state = self.state();
        let instance = state
            .disks
            .get(disk)
            .cloned()
            .flatten()
            .and_then(|vm| state.instance_of_vm(&vm));
        state.log(instance, "snapshot");
        if state.faults.snapshots_fail {
            return Err(CollaboratorError::new("snapshot", "snapshot quota exceeded"));
        }
        SnapshotCid::new(cid).map_err(|e| CollaboratorError::new("snapshot", e.to_string()))
    }
}

#[async_trait]
impl TemplateCleaner for SimFleet {
    async fn clean(&self, instance: &InstanceId) -> Result<(), CollaboratorError> {
        self.state().log(Some(*instance), "clean_templates");
        Ok(())
    }
}

#[async_trait]
impl DnsPublisher for SimFleet {
    async fn upsert_record(
        &self,
        _domain: &str,
        name: &str,
        ip: &str,
    ) -> Result<(), CollaboratorError> {
        let mut state = self.state();
        state.log(None, "upsert_record");
        state.dns.insert(name.to_string(), ip.to_string());
        Ok(())
    }

    async fn flush_cache(&self) -> Result<(), CollaboratorError> {
        let mut state = self.state();
        state.log(None, "flush_cache");
        state.dns_flushes += 1;
        Ok(())
    }
}

// =============================================================================
// Sleeper
// =============================================================================

/// Sleeper that records requested durations instead of waiting.
///
/// Optionally raises a cancellation flag once a number of sleeps happened,
/// which lets tests cancel in the middle of an otherwise endless drain.
#[derive(Default)]
pub struct SimSleeper {
    slept: Mutex<Vec<Duration>>,
    cancel_after: Option<(usize, watch::Sender<bool>)>,
}

impl SimSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_after(mut self, sleeps: usize, tx: watch::Sender<bool>) -> Self {
        self.cancel_after = Some((sleeps, tx));
        self
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Sleeper for SimSleeper {
    async fn sleep(&self, duration: Duration) {
        let count = {
            let mut slept = self.slept.lock().unwrap_or_else(|e| e.into_inner());
            slept.push(duration);
            slept.len()
        };
        if let Some((after, tx)) = &self.cancel_after {
            if count >= *after {
                let _ = tx.send(true);
            }
        }
        tokio::task::yield_now().await;
    }
}
