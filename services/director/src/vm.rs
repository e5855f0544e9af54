//! VM handling for a single instance: delete, create, recreate.

use std::sync::Arc;

use rollout_id::DiskCid;
use tracing::{debug, info};

use crate::agent::{AgentClient, AgentDeadlines, TimedAgent};
use crate::cloud::VmRequest;
use crate::collaborators::Collaborators;
use crate::error::UpdateError;
use crate::plan::{ApplySpec, InstancePlan};
use crate::store::{InstanceRecord, VmRecord};

/// The instance being converged and the VM currently backing it.
///
/// Owned by exactly one convergence; the agent handle is never shared.
pub struct InstanceContext {
    pub record: InstanceRecord,
    vm: Option<VmRecord>,
    agent: Option<Arc<dyn AgentClient>>,
}

impl InstanceContext {
    pub fn new(
        record: InstanceRecord,
        vm: Option<VmRecord>,
        agent: Option<Arc<dyn AgentClient>>,
    ) -> Self {
        Self { record, vm, agent }
    }

    pub fn has_vm(&self) -> bool {
        self.vm.is_some()
    }

    pub fn vm(&self) -> Result<&VmRecord, UpdateError> {
        self.vm
            .as_ref()
            .ok_or_else(|| UpdateError::UnexpectedVmAbsence(self.record.name()))
    }

    pub fn agent(&self) -> Result<Arc<dyn AgentClient>, UpdateError> {
        self.agent
            .clone()
            .ok_or_else(|| UpdateError::UnexpectedVmAbsence(self.record.name()))
    }
}

/// Creates and deletes the VM of one instance, keeping the store in step.
pub struct VmManager<'a> {
    collab: &'a Collaborators,
    deployment: &'a str,
    deadlines: AgentDeadlines,
}

impl<'a> VmManager<'a> {
    pub fn new(collab: &'a Collaborators, deployment: &'a str, deadlines: AgentDeadlines) -> Self {
        Self {
            collab,
            deployment,
            deadlines,
        }
    }

    /// Agent handle for a VM, bounded by the agent deadlines.
    pub fn connect(&self, vm: &VmRecord) -> Arc<dyn AgentClient> {
        Arc::new(TimedAgent::new(
            self.collab.agents.connect(&vm.agent_id),
            self.deadlines,
        ))
    }

    /// Loads the recorded VM of an instance and connects to its agent.
    pub fn load(&self, record: InstanceRecord) -> Result<InstanceContext, UpdateError> {
        let vm = self.collab.store.vm(&record.id)?;
        let agent = vm.as_ref().map(|vm| self.connect(vm));
        Ok(InstanceContext::new(record, vm, agent))
    }

    /// Deletes the VM, if any. The active persistent disk is unmounted and
    /// detached first and stays recorded on the instance.
    pub async fn delete(&self, ctx: &mut InstanceContext) -> Result<(), UpdateError> {
        let Some(vm) = ctx.vm.clone() else {
            return Ok(());
        };

        if let Some(disk) = self.collab.store.active_disk(&ctx.record.id)? {
            self.detach_disk(ctx, &vm, &disk.cid).await?;
        }

        info!(instance = %ctx.record.name(), vm = %vm.cid, "Deleting VM");
        self.collab.vms.delete(&vm.cid).await?;
        self.collab.store.clear_vm(&ctx.record.id)?;
        ctx.vm = None;
        ctx.agent = None;
        Ok(())
    }

    /// Creates a VM, attaches and mounts the active persistent disk, then
    /// applies the minimal spec.
    ///
    /// `pending` is a disk about to be attached by the caller. It is passed
    /// to the provider with the active disk so the VM lands where both fit.
    pub async fn create(
        &self,
        ctx: &mut InstanceContext,
        plan: &InstancePlan,
        pending: Option<&DiskCid>,
    ) -> Result<(), UpdateError> {
        let active = self.collab.store.active_disk(&ctx.record.id)?;
        let desired = &plan.desired;
        let request = VmRequest {
            instance: ctx.record.id,
            stemcell: desired.stemcell.clone(),
            resource_profile: desired.resource_profile.clone(),
            networks: desired.networks.clone(),
            env: desired.env.clone(),
            disks: active
                .iter()
                .map(|d| d.cid.clone())
                .chain(pending.cloned())
                .collect(),
        };

        let created = self.collab.vms.create(&request).await?;
        let mut vm = VmRecord {
            cid: created.cid,
            agent_id: created.agent_id,
            applied_spec: None,
        };
        self.collab.store.set_vm(&ctx.record.id, &vm)?;
        let agent = self.connect(&vm);
        ctx.vm = Some(vm.clone());
        ctx.agent = Some(agent.clone());

        if let Some(disk) = &active {
            self.attach_disk(ctx, &disk.cid).await?;
        }

        let minimal = ApplySpec::minimal(plan, self.deployment);
        agent.apply(&minimal).await?;
        let hash = minimal.hash();
        self.collab.store.record_applied_spec(&ctx.record.id, &hash)?;
        vm.applied_spec = Some(hash);
        info!(instance = %ctx.record.name(), vm = %vm.cid, "VM ready");
        ctx.vm = Some(vm);

        Ok(())
    }

    /// Replaces the VM, moving the active persistent disk over.
    pub async fn recreate(
        &self,
        ctx: &mut InstanceContext,
        plan: &InstancePlan,
        pending: Option<&DiskCid>,
    ) -> Result<(), UpdateError> {
        self.delete(ctx).await?;
        self.create(ctx, plan, pending).await
    }

    async fn detach_disk(
        &self,
        ctx: &InstanceContext,
        vm: &VmRecord,
        disk: &DiskCid,
    ) -> Result<(), UpdateError> {
        ctx.agent()?.unmount_disk(disk).await?;
        match self.collab.cloud.detach_disk(&vm.cid, disk).await {
            Ok(()) => {}
            Err(e) if e.is_already_gone() => {
                debug!(disk = %disk, error = %e, "Disk already detached");
            }
            Err(e) => return Err(e.into()),
        }
        debug!(instance = %ctx.record.name(), disk = %disk, "Persistent disk detached");
        Ok(())
    }

    async fn attach_disk(&self, ctx: &InstanceContext, disk: &DiskCid) -> Result<(), UpdateError> {
        let vm = ctx.vm()?.cid.clone();
        self.collab.cloud.attach_disk(&vm, disk).await?;
        ctx.agent()?.mount_disk(disk).await?;
        debug!(instance = %ctx.record.name(), disk = %disk, vm = %vm, "Persistent disk attached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::fixtures::plan;
    use crate::plan::TargetState;
    use crate::sim::SimFleet;
    use crate::store::Store;
    use rollout_reconcile::ChangeKind;
    use std::time::Duration;

    fn deadlines() -> AgentDeadlines {
        AgentDeadlines::uniform(Duration::from_secs(5))
    }

    fn record(p: &InstancePlan) -> InstanceRecord {
        InstanceRecord {
            id: p.instance,
            deployment: "prod".into(),
            group: p.desired.group.clone(),
            index: p.desired.index,
            availability_zone: None,
            state: TargetState::Started,
        }
    }

    #[tokio::test]
    async fn test_recreate_keeps_disk_and_applies_minimal_spec() {
        let fleet = SimFleet::new();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let collab = fleet.collaborators(store.clone());
        let p = plan("db", 0, &[ChangeKind::Stemcell]);
        let old = fleet.seed_instance(&store, &record(&p), Some(1024)).unwrap();
        let disk = store.active_disk(&p.instance).unwrap().unwrap();

        let vms = VmManager::new(&collab, "prod", deadlines());
        let mut ctx = vms.load(record(&p)).unwrap();
        vms.recreate(&mut ctx, &p, None).await.unwrap();

        let new = store.vm(&p.instance).unwrap().unwrap();
        assert_ne!(new.cid, old.cid);
        assert_eq!(
            new.applied_spec,
            Some(ApplySpec::minimal(&p, "prod").hash())
        );
        assert_eq!(fleet.attachment(&disk.cid), Some(new.cid));
        assert_eq!(fleet.mounted_disks(&p.instance), vec![disk.cid.clone()]);
        assert_eq!(fleet.vm_count(), 1);
        assert_eq!(
            fleet.calls_for(&p.instance),
            vec![
                "unmount_disk",
                "detach_disk",
                "delete_vm",
                "create_vm",
                "attach_disk",
                "mount_disk",
                "apply",
            ]
        );
    }

    #[tokio::test]
    async fn test_recreate_places_vm_near_pending_disk() {
        let fleet = SimFleet::new();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let collab = fleet.collaborators(store.clone());
        let p = plan("db", 0, &[ChangeKind::PersistentDisk]);
        fleet.seed_instance(&store, &record(&p), Some(1024)).unwrap();
        let active = store.active_disk(&p.instance).unwrap().unwrap();
        let pending = collab
            .cloud
            .create_disk(2048, &serde_json::Value::Null, None)
            .await
            .unwrap();

        let vms = VmManager::new(&collab, "prod", deadlines());
        let mut ctx = vms.load(record(&p)).unwrap();
        vms.recreate(&mut ctx, &p, Some(&pending)).await.unwrap();

        let requests = fleet.vm_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].disks, vec![active.cid.clone(), pending.clone()]);
        // Only the active disk is moved over; the caller attaches the other.
        let new = store.vm(&p.instance).unwrap().unwrap();
        assert_eq!(fleet.attachment(&active.cid), Some(new.cid));
        assert_eq!(fleet.attachment(&pending), None);
    }

    #[tokio::test]
    async fn test_delete_detaches_disk_before_vm() {
        let fleet = SimFleet::new();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let collab = fleet.collaborators(store.clone());
        let p = plan("db", 0, &[ChangeKind::JobTemplates]);
        fleet.seed_instance(&store, &record(&p), Some(1024)).unwrap();
        let disk = store.active_disk(&p.instance).unwrap().unwrap();

        let vms = VmManager::new(&collab, "prod", deadlines());
        let mut ctx = vms.load(record(&p)).unwrap();
        vms.delete(&mut ctx).await.unwrap();

        assert!(!ctx.has_vm());
        assert_eq!(fleet.vm_count(), 0);
        assert_eq!(fleet.attachment(&disk.cid), None);
        assert_eq!(store.active_disk(&p.instance).unwrap(), Some(disk));
        assert_eq!(
            fleet.calls_for(&p.instance),
            vec!["unmount_disk", "detach_disk", "delete_vm"]
        );
    }

    #[tokio::test]
    async fn test_agent_without_vm_is_consistency_error() {
        let p = plan("web", 0, &[ChangeKind::JobTemplates]);
        let ctx = InstanceContext::new(record(&p), None, None);

        assert!(matches!(ctx.agent(), Err(e) if e.is_consistency()));
        assert!(!ctx.has_vm());
    }
}
