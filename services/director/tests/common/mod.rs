//! Shared setup for the director integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use rollout_director::cancel::Cancellation;
use rollout_director::collaborators::StoreInstanceDeleter;
use rollout_director::plan::{
    DesiredInstance, DiskPolicy, ExistingInstance, InstancePlan, NetworkSettings, PlanFlags,
    TargetState,
};
use rollout_director::progress::{MemoryEventSink, ProgressReporter};
use rollout_director::sim::{SimFleet, SimSleeper};
use rollout_director::store::{InstanceRecord, Store, VmRecord};
use rollout_director::{DirectorConfig, InstanceUpdater, RolloutScheduler};
use rollout_id::{InstanceId, TaskId};
use rollout_reconcile::{ChangeKind, Quantity, UpdateConfig, WatchRange};

pub fn desired(group: &str, index: u32) -> DesiredInstance {
    DesiredInstance {
        group: group.to_string(),
        index,
        availability_zone: None,
        target_state: TargetState::Started,
        resource_profile: "small".to_string(),
        stemcell: "ubuntu-jammy/1.0".to_string(),
        networks: vec![NetworkSettings {
            name: "private".to_string(),
            ip: format!("10.0.1.{}", index + 20),
        }],
        env: serde_json::Value::Null,
        persistent_disk: DiskPolicy::default(),
        jobs: vec!["app".to_string()],
        trusted_certs: String::new(),
        compilation: false,
    }
}

/// Plan for an existing, started instance.
pub fn plan(group: &str, index: u32, changes: &[ChangeKind]) -> InstancePlan {
    InstancePlan {
        instance: InstanceId::new(),
        desired: desired(group, index),
        existing: Some(ExistingInstance {
            state: TargetState::Started,
        }),
        changes: changes.iter().copied().collect(),
        flags: PlanFlags::default(),
    }
}

pub fn update_config(canaries: u32, max_in_flight: u32) -> UpdateConfig {
    UpdateConfig::new(
        Quantity::Count(canaries),
        Quantity::Count(max_in_flight),
        WatchRange::new(1000, 3000).unwrap(),
        WatchRange::new(1000, 3000).unwrap(),
    )
}

/// A simulated fleet, its store, and the sinks a run reports to.
pub struct Env {
    pub fleet: SimFleet,
    pub store: Arc<Store>,
    pub sleeper: Arc<SimSleeper>,
    pub events: Arc<MemoryEventSink>,
    pub config: DirectorConfig,
}

impl Env {
    pub fn new() -> Self {
        Self::with_store(Store::open_in_memory().unwrap())
    }

    pub fn with_store(store: Store) -> Self {
        Self {
            fleet: SimFleet::new(),
            store: Arc::new(store),
            sleeper: Arc::new(SimSleeper::new()),
            events: Arc::new(MemoryEventSink::new()),
            config: DirectorConfig::default(),
        }
    }

    /// Gives an existing instance a running VM, with a disk of
    /// `disk_size_mb` if set.
    pub fn seed(&self, plan: &InstancePlan, disk_size_mb: Option<u64>) -> VmRecord {
        let record = InstanceRecord {
            id: plan.instance,
            deployment: self.config.deployment.clone(),
            group: plan.desired.group.clone(),
            index: plan.desired.index,
            availability_zone: plan.desired.availability_zone.clone(),
            state: plan.recorded_state().unwrap_or(TargetState::Started),
        };
        self.fleet
            .seed_instance(&self.store, &record, disk_size_mb)
            .unwrap()
    }

    pub fn updater(&self) -> InstanceUpdater {
        InstanceUpdater::new(
            self.fleet.collaborators(self.store.clone()),
            self.config.clone(),
            self.sleeper.clone(),
            Cancellation::never(),
        )
    }

    pub fn scheduler(&self) -> RolloutScheduler {
        let collab = self.fleet.collaborators(self.store.clone());
        let deleter = Arc::new(StoreInstanceDeleter::new(
            self.store.clone(),
            collab.cloud.clone(),
            collab.vms.clone(),
        ));
        let progress = Arc::new(ProgressReporter::new(TaskId::new(), self.events.clone()));
        RolloutScheduler::new(Arc::new(self.updater()), deleter, progress)
    }
}
