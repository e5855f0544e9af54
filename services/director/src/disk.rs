//! Persistent disk reconciliation.
//!
//! Brings the disk of one instance in line with its desired disk policy:
//!
//! 1. Reattach an active disk the agent lost, then compare the agent's disk
//!    list with the director's records.
//! 2. If the disk policy changed, create and attach a new disk, mount it and
//!    migrate data from the old one. Failures here discard the new disk and
//!    leave the old one untouched.
//! 3. Swap the active flags in one store transaction.
//! 4. Unmount, detach and orphan the old disk, then sweep any other inactive
//!    disks the instance still holds.

use rollout_id::{DiskCid, DiskId};
use rollout_reconcile::ChangeKind;
use tracing::{debug, info, warn};

use crate::agent::AgentClient;
use crate::collaborators::Collaborators;
use crate::error::UpdateError;
use crate::plan::InstancePlan;
use crate::store::{DiskRecord, PendingActivation};
use crate::vm::{InstanceContext, VmManager};

/// Runs disk reconciliation for one instance.
pub struct DiskCoordinator<'a> {
    collab: &'a Collaborators,
    vms: &'a VmManager<'a>,
}

impl<'a> DiskCoordinator<'a> {
    pub fn new(collab: &'a Collaborators, vms: &'a VmManager<'a>) -> Self {
        Self { collab, vms }
    }

    /// Verifies disk bookkeeping and migrates when the plan changes the disk.
    pub async fn reconcile(
        &self,
        ctx: &mut InstanceContext,
        plan: &InstancePlan,
    ) -> Result<(), UpdateError> {
        self.attach_missing(ctx, plan).await?;
        self.check(ctx, plan).await?;

        if !plan.changes.contains(ChangeKind::PersistentDisk) {
            return Ok(());
        }
        self.migrate(ctx, plan).await
    }

    /// Disks the agent reports. Agents without `list_disk` are assumed to
    /// hold exactly the active disk.
    async fn reported_disks(
        &self,
        agent: &dyn AgentClient,
        active: Option<&DiskRecord>,
    ) -> Result<Vec<DiskCid>, UpdateError> {
        match agent.list_disk().await {
            Ok(disks) => Ok(disks),
            Err(e) if e.is_unsupported() => {
                debug!(error = %e, "Agent cannot list disks, assuming recorded state");
                Ok(active.map(|d| vec![d.cid.clone()]).unwrap_or_default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn attach_missing(
        &self,
        ctx: &mut InstanceContext,
        plan: &InstancePlan,
    ) -> Result<(), UpdateError> {
        if !ctx.has_vm() || !plan.desired.persistent_disk.needs_disk() {
            return Ok(());
        }
        let Some(disk) = self.collab.store.active_disk(&ctx.record.id)? else {
            return Ok(());
        };

        let reported = self
            .reported_disks(ctx.agent()?.as_ref(), Some(&disk))
            .await?;
        if reported.contains(&disk.cid) {
            return Ok(());
        }

        info!(instance = %ctx.record.name(), disk = %disk.cid, "Reattaching missing persistent disk");
        let vm = ctx.vm()?.cid.clone();
        match self.collab.cloud.attach_disk(&vm, &disk.cid).await {
            Ok(()) => {
                ctx.agent()?.mount_disk(&disk.cid).await?;
                Ok(())
            }
            Err(e) if e.is_retriable() => {
                warn!(instance = %ctx.record.name(), error = %e, "No space to reattach disk, recreating VM");
                // The replacement VM gets the active disk attached and mounted.
                self.vms.recreate(ctx, plan, None).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Compares the agent's disks with the director's active disk.
    async fn check(&self, ctx: &InstanceContext, plan: &InstancePlan) -> Result<(), UpdateError> {
        if !ctx.has_vm() {
            return Ok(());
        }
        let active = self.collab.store.active_disk(&ctx.record.id)?;
        let reported = self
            .reported_disks(ctx.agent()?.as_ref(), active.as_ref())
            .await?;

        if reported.is_empty() {
            return match active {
                Some(disk) if !plan.desired.persistent_disk.needs_disk() => {
                    info!(instance = %ctx.record.name(), disk = %disk.cid, "Disk no longer expected, orphaning");
                    self.detach_and_orphan(ctx, &disk).await
                }
                Some(disk) => Err(out_of_sync(ctx, &reported, Some(&disk))),
                None => Ok(()),
            };
        }

        let matches = reported.len() == 1 && active.as_ref().map(|d| &d.cid) == reported.first();
        if !matches {
            return Err(out_of_sync(ctx, &reported, active.as_ref()));
        }
        Ok(())
    }

    async fn migrate(
        &self,
        ctx: &mut InstanceContext,
        plan: &InstancePlan,
    ) -> Result<(), UpdateError> {
        let instance = ctx.record.id;
        let old = self.collab.store.active_disk(&instance)?;

        let new = if plan.desired.persistent_disk.needs_disk() {
            let disk = self.create_and_attach(ctx, plan).await?;
            if let Err(e) = self.mount_and_migrate(ctx, old.as_ref(), &disk).await {
                warn!(instance = %ctx.record.name(), disk = %disk.cid, error = %e, "Disk migration failed, discarding new disk");
                self.discard(ctx, &disk).await;
                return Err(e);
            }
            Some(disk)
        } else {
            None
        };

        self.collab.store.commit_activation(PendingActivation::new(
            instance,
            old.as_ref().map(|d| d.id),
            new.as_ref().map(|d| d.id),
        ))?;
        info!(
            instance = %ctx.record.name(),
            old = ?old.as_ref().map(|d| d.cid.to_string()),
            new = ?new.as_ref().map(|d| d.cid.to_string()),
            "Persistent disk switched"
        );

        if let Some(old) = &old {
            ctx.agent()?.unmount_disk(&old.cid).await?;
            self.detach_and_orphan(ctx, old).await?;
        }

        for stale in self.collab.store.inactive_disks(&instance)? {
            debug!(instance = %ctx.record.name(), disk = %stale.cid, "Sweeping inactive disk");
            self.detach_and_orphan(ctx, &stale).await?;
        }
        Ok(())
    }

    /// Creates the new disk and attaches it. On a retriable attach failure
    /// the VM is recreated near the new disk and the attach is tried once
    /// more. The new disk is orphaned if it cannot be attached.
    async fn create_and_attach(
        &self,
        ctx: &mut InstanceContext,
        plan: &InstancePlan,
    ) -> Result<DiskRecord, UpdateError> {
        let policy = &plan.desired.persistent_disk;
        let vm = ctx.vm()?.cid.clone();
        let cid = self
            .collab
            .cloud
            .create_disk(policy.size_mb, &policy.cloud_properties, Some(&vm))
            .await?;

        let disk = DiskRecord {
            id: DiskId::new(),
            instance: ctx.record.id,
            cid,
            size_mb: policy.size_mb,
            cloud_properties: policy.cloud_properties.clone(),
            active: false,
        };
        self.collab.store.insert_disk(&disk)?;
        info!(instance = %ctx.record.name(), disk = %disk.cid, size_mb = disk.size_mb, "Persistent disk created");

        if let Err(e) = self.attach(ctx, plan, &disk).await {
            if let Err(orphan_err) = self.collab.store.orphan_disk(&disk.id) {
                warn!(disk = %disk.cid, error = %orphan_err, "Failed to orphan unattached disk");
            }
            return Err(e);
        }
        Ok(disk)
    }

    async fn attach(
        &self,
        ctx: &mut InstanceContext,
        plan: &InstancePlan,
        disk: &DiskRecord,
    ) -> Result<(), UpdateError> {
        let vm = ctx.vm()?.cid.clone();
        match self.collab.cloud.attach_disk(&vm, &disk.cid).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_retriable() => {
                warn!(instance = %ctx.record.name(), disk = %disk.cid, error = %e, "No space to attach disk, recreating VM");
                self.vms.recreate(ctx, plan, Some(&disk.cid)).await?;
                let vm = ctx.vm()?.cid.clone();
                self.collab.cloud.attach_disk(&vm, &disk.cid).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mount_and_migrate(
        &self,
        ctx: &InstanceContext,
        old: Option<&DiskRecord>,
        new: &DiskRecord,
    ) -> Result<(), UpdateError> {
        let agent = ctx.agent()?;
        agent.mount_disk(&new.cid).await?;
        if let Some(old) = old {
            agent.migrate_disk(&old.cid, &new.cid).await?;
        }
        Ok(())
    }

    /// Best-effort removal of a new disk after a failed migration.
    async fn discard(&self, ctx: &InstanceContext, disk: &DiskRecord) {
        if let Ok(agent) = ctx.agent() {
            if let Err(e) = agent.unmount_disk(&disk.cid).await {
                warn!(disk = %disk.cid, error = %e, "Failed to unmount discarded disk");
            }
        }
        if let Err(e) = self.detach_and_orphan(ctx, disk).await {
            warn!(disk = %disk.cid, error = %e, "Failed to orphan discarded disk");
        }
    }

    async fn detach_and_orphan(
        &self,
        ctx: &InstanceContext,
        disk: &DiskRecord,
    ) -> Result<(), UpdateError> {
        if let Ok(vm) = ctx.vm() {
            match self.collab.cloud.detach_disk(&vm.cid, &disk.cid).await {
                Ok(()) => {}
                Err(e) if e.is_already_gone() => {
                    debug!(disk = %disk.cid, error = %e, "Disk already detached");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let orphan = self.collab.store.orphan_disk(&disk.id)?;
        info!(disk = %orphan.cid, orphan = %orphan.id, "Persistent disk orphaned");
        Ok(())
    }
}

fn out_of_sync(
    ctx: &InstanceContext,
    reported: &[DiskCid],
    active: Option<&DiskRecord>,
) -> UpdateError {
    UpdateError::AgentDiskOutOfSync {
        instance: ctx.record.name(),
        reported: reported.iter().map(ToString::to_string).collect(),
        expected: active.map(|d| d.cid.to_string()),
    }
}
