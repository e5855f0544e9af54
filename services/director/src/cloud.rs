//! Provider-cloud interface.

use async_trait::async_trait;
use rollout_id::{AgentId, DiskCid, InstanceId, VmCid};
use thiserror::Error;

use crate::plan::NetworkSettings;

/// Errors from the cloud provider.
#[derive(Debug, Clone, Error)]
pub enum CloudError {
    /// The placement has no room for the disk.
    #[error("no disk space available (ok_to_retry: {ok_to_retry})")]
    NoDiskSpace { ok_to_retry: bool },

    /// The provider could not boot the VM.
    #[error("vm creation failed (ok_to_retry: {ok_to_retry}): {message}")]
    VmCreationFailed { ok_to_retry: bool, message: String },

    #[error("disk {0} not found")]
    DiskNotFound(DiskCid),

    #[error("disk {0} is not attached")]
    DiskNotAttached(DiskCid),

    #[error("vm {0} not found")]
    VmNotFound(VmCid),

    #[error("cloud call {method} failed: {message}")]
    Other {
        method: &'static str,
        message: String,
    },
}

impl CloudError {
    /// True for conditions the provider expects to clear on another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CloudError::NoDiskSpace { ok_to_retry: true }
                | CloudError::VmCreationFailed {
                    ok_to_retry: true,
                    ..
                }
        )
    }

    /// True if the error means the resource is already in the target state
    /// of a detach or delete.
    pub fn is_already_gone(&self) -> bool {
        matches!(
            self,
            CloudError::DiskNotFound(_) | CloudError::DiskNotAttached(_) | CloudError::VmNotFound(_)
        )
    }
}

/// Everything the provider needs to boot a VM for an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct VmRequest {
    pub instance: InstanceId,
    pub stemcell: String,
    pub resource_profile: String,
    pub networks: Vec<NetworkSettings>,
    pub env: serde_json::Value,
    /// Persistent disks the VM will use. A placement hint only; the disks
    /// are attached separately once the VM exists.
    pub disks: Vec<DiskCid>,
}

/// A VM created by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedVm {
    pub cid: VmCid,
    pub agent_id: AgentId,
}

/// Provider operations. Handles are stateless and freely shared.
#[async_trait]
pub trait Cloud: Send + Sync {
    async fn create_disk(
        &self,
        size_mb: u64,
        cloud_properties: &serde_json::Value,
        vm: Option<&VmCid>,
    ) -> Result<DiskCid, CloudError>;

    async fn attach_disk(&self, vm: &VmCid, disk: &DiskCid) -> Result<(), CloudError>;

    async fn detach_disk(&self, vm: &VmCid, disk: &DiskCid) -> Result<(), CloudError>;

    async fn delete_vm(&self, vm: &VmCid) -> Result<(), CloudError>;

    async fn create_vm(&self, request: &VmRequest) -> Result<CreatedVm, CloudError>;
}
