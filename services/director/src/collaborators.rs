//! Opaque collaborators the engine drives but does not interpret.

use std::sync::Arc;

use async_trait::async_trait;
use rollout_id::{DiskCid, InstanceId, SnapshotCid, VmCid};
use tracing::{debug, info, warn};

use crate::agent::AgentConnector;
use crate::cloud::{Cloud, CloudError, CreatedVm, VmRequest};
use crate::dns::DnsPublisher;
use crate::error::CollaboratorError;
use crate::plan::NetworkSettings;
use crate::store::Store;

/// Creates and deletes VMs. Owns any retry policy for VM creation.
#[async_trait]
pub trait VmLifecycle: Send + Sync {
    async fn create(&self, request: &VmRequest) -> Result<CreatedVm, CloudError>;

    async fn delete(&self, vm: &VmCid) -> Result<(), CloudError>;
}

/// Reconfigures networking of a running VM in place.
#[async_trait]
pub trait NetworkUpdater: Send + Sync {
    async fn update(&self, vm: &VmCid, networks: &[NetworkSettings])
        -> Result<(), CollaboratorError>;
}

/// Removes an instance that is no longer desired.
#[async_trait]
pub trait InstanceDeleter: Send + Sync {
    async fn delete(&self, instance: &InstanceId) -> Result<(), CollaboratorError>;
}

/// Takes snapshots of persistent disks.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn snapshot_disk(&self, disk: &DiskCid, clean: bool)
        -> Result<SnapshotCid, CollaboratorError>;
}

/// Removes rendered template archives an instance no longer uses.
#[async_trait]
pub trait TemplateCleaner: Send + Sync {
    async fn clean(&self, instance: &InstanceId) -> Result<(), CollaboratorError>;
}

/// Everything one instance convergence talks to.
///
/// Cheap to clone; every handle is shared.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<Store>,
    pub cloud: Arc<dyn Cloud>,
    pub agents: Arc<dyn AgentConnector>,
    pub vms: Arc<dyn VmLifecycle>,
    pub networks: Arc<dyn NetworkUpdater>,
    pub snapshots: Arc<dyn Snapshotter>,
    pub templates: Arc<dyn TemplateCleaner>,
    pub dns: Arc<dyn DnsPublisher>,
}

// =============================================================================
// Cloud-backed VM lifecycle
// =============================================================================

/// Default number of attempts for a VM creation the provider marks retriable.
pub const DEFAULT_CREATE_ATTEMPTS: u32 = 5;

/// VM lifecycle on top of the provider interface.
pub struct CloudVmLifecycle {
    cloud: Arc<dyn Cloud>,
    max_attempts: u32,
}

impl CloudVmLifecycle {
    pub fn new(cloud: Arc<dyn Cloud>) -> Self {
        Self {
            cloud,
            max_attempts: DEFAULT_CREATE_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

#[async_trait]
impl VmLifecycle for CloudVmLifecycle {
    async fn create(&self, request: &VmRequest) -> Result<CreatedVm, CloudError> {
        let mut attempt = 1;
        loop {
            match self.cloud.create_vm(request).await {
                Ok(vm) => {
                    info!(instance = %request.instance, vm = %vm.cid, attempt, "VM created");
                    return Ok(vm);
                }
                Err(e) if e.is_retriable() && attempt < self.max_attempts => {
                    warn!(instance = %request.instance, attempt, error = %e, "VM creation failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn delete(&self, vm: &VmCid) -> Result<(), CloudError> {
        match self.cloud.delete_vm(vm).await {
            Ok(()) => Ok(()),
            Err(e @ CloudError::VmNotFound(_)) => {
                debug!(vm = %vm, error = %e, "VM already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Unneeded instance deletion
// =============================================================================

/// Deletes an instance: its VM, its persistent disks (orphaned, not
/// destroyed) and finally its record.
pub struct StoreInstanceDeleter {
    store: Arc<Store>,
    cloud: Arc<dyn Cloud>,
    vms: Arc<dyn VmLifecycle>,
}

impl StoreInstanceDeleter {
    pub fn new(store: Arc<Store>, cloud: Arc<dyn Cloud>, vms: Arc<dyn VmLifecycle>) -> Self {
        Self { store, cloud, vms }
    }

    async fn delete_instance(&self, instance: &InstanceId) -> anyhow::Result<()> {
        let vm = self.store.vm(instance)?;

        for disk in self.store.disks(instance)? {
            if let Some(vm) = &vm {
                match self.cloud.detach_disk(&vm.cid, &disk.cid).await {
                    Ok(()) => {}
                    Err(e) if e.is_already_gone() => {
                        debug!(disk = %disk.cid, error = %e, "Disk already detached");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            self.store.orphan_disk(&disk.id)?;
        }

        if let Some(vm) = vm {
            self.vms.delete(&vm.cid).await?;
            self.store.clear_vm(instance)?;
        }

        self.store.delete_instance(instance)?;
        Ok(())
    }
}

#[async_trait]
impl InstanceDeleter for StoreInstanceDeleter {
    async fn delete(&self, instance: &InstanceId) -> Result<(), CollaboratorError> {
        self.delete_instance(instance)
            .await
            .map_err(|e| CollaboratorError::new("delete instance", format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::TargetState;
    use crate::sim::SimFleet;
    use crate::store::InstanceRecord;

    fn request() -> VmRequest {
        VmRequest {
            instance: InstanceId::new(),
            stemcell: "ubuntu-noble/1.0".to_string(),
            resource_profile: "small".to_string(),
            networks: vec![],
            env: serde_json::Value::Null,
            disks: vec![],
        }
    }

    fn creation_failed(ok_to_retry: bool) -> CloudError {
        CloudError::VmCreationFailed {
            ok_to_retry,
            message: "no capacity in zone".to_string(),
        }
    }

    #[tokio::test]
    async fn test_retriable_create_failure_is_retried() {
        let fleet = SimFleet::new();
        fleet.fail_next_create_vm(creation_failed(true));
        let vms = CloudVmLifecycle::new(Arc::new(fleet.clone()));

        vms.create(&request()).await.unwrap();

        assert_eq!(fleet.count("create_vm"), 2);
        assert_eq!(fleet.vm_count(), 1);
    }

    #[tokio::test]
    async fn test_non_retriable_create_failure_is_returned() {
        let fleet = SimFleet::new();
        fleet.fail_next_create_vm(creation_failed(false));
        let vms = CloudVmLifecycle::new(Arc::new(fleet.clone()));

        let err = vms.create(&request()).await.unwrap_err();

        assert!(matches!(
            err,
            CloudError::VmCreationFailed {
                ok_to_retry: false,
                ..
            }
        ));
        assert_eq!(fleet.count("create_vm"), 1);
        assert_eq!(fleet.vm_count(), 0);
    }

    #[tokio::test]
    async fn test_create_gives_up_after_max_attempts() {
        let fleet = SimFleet::new();
        for _ in 0..3 {
            fleet.fail_next_create_vm(creation_failed(true));
        }
        let vms = CloudVmLifecycle::new(Arc::new(fleet.clone())).with_max_attempts(2);

        let err = vms.create(&request()).await.unwrap_err();

        assert!(err.is_retriable());
        assert_eq!(fleet.count("create_vm"), 2);
    }

    #[tokio::test]
    async fn test_deleter_detaches_and_orphans_disk_before_vm() {
        let fleet = SimFleet::new();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let record = InstanceRecord {
            id: InstanceId::new(),
            deployment: "prod".into(),
            group: "db".into(),
            index: 0,
            availability_zone: None,
            state: TargetState::Started,
        };
        fleet.seed_instance(&store, &record, Some(1024)).unwrap();
        let disk = store.active_disk(&record.id).unwrap().unwrap();
        let collab = fleet.collaborators(store.clone());
        let deleter = StoreInstanceDeleter::new(store.clone(), collab.cloud, collab.vms);

        InstanceDeleter::delete(&deleter, &record.id).await.unwrap();

        assert_eq!(fleet.calls_for(&record.id), vec!["detach_disk", "delete_vm"]);
        assert_eq!(fleet.attachment(&disk.cid), None);
        assert_eq!(fleet.vm_count(), 0);
        assert!(store.instance(&record.id).unwrap().is_none());
        assert_eq!(store.list_orphan_disks().unwrap()[0].cid, disk.cid);
    }
}
