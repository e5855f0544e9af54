//! Instance plans: the desired-vs-existing delta for one instance.

use rollout_events::instance_task_label;
use rollout_id::InstanceId;
use rollout_reconcile::{ChangeKind, ChangeSet, SpecHash};
use serde::{Deserialize, Serialize};

/// Lifecycle state an instance is converged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Started,
    Stopped,
    /// VM deleted, persistent disk kept.
    Detached,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Detached => "detached",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "stopped" => Some(Self::Stopped),
            "detached" => Some(Self::Detached),
            _ => None,
        }
    }
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of an instance on one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub name: String,
    pub ip: String,
}

/// Desired persistent disk. A size of zero means no disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskPolicy {
    #[serde(default)]
    pub size_mb: u64,

    #[serde(default)]
    pub cloud_properties: serde_json::Value,
}

impl DiskPolicy {
    pub fn sized(size_mb: u64) -> Self {
        Self {
            size_mb,
            cloud_properties: serde_json::Value::Null,
        }
    }

    pub fn needs_disk(&self) -> bool {
        self.size_mb > 0
    }
}

/// The desired logical instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredInstance {
    /// Instance group (job) name.
    pub group: String,

    pub index: u32,

    #[serde(default)]
    pub availability_zone: Option<String>,

    pub target_state: TargetState,

    pub resource_profile: String,

    pub stemcell: String,

    #[serde(default)]
    pub networks: Vec<NetworkSettings>,

    #[serde(default)]
    pub env: serde_json::Value,

    #[serde(default)]
    pub persistent_disk: DiskPolicy,

    /// Job templates rendered onto the instance.
    #[serde(default)]
    pub jobs: Vec<String>,

    /// PEM bundle pushed with the agent settings.
    #[serde(default)]
    pub trusted_certs: String,

    /// Compilation VMs are never drained or stopped.
    #[serde(default)]
    pub compilation: bool,
}

/// What the director last recorded for an instance that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingInstance {
    pub state: TargetState,
}

/// Operator flags attached to a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFlags {
    /// Recreate this instance's VM.
    #[serde(default)]
    pub recreate: bool,

    /// Recreate every VM of the deployment.
    #[serde(default)]
    pub recreate_deployment: bool,

    /// Stop without running the drain script.
    #[serde(default)]
    pub skip_drain: bool,
}

/// The unit of scheduling work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancePlan {
    pub instance: InstanceId,

    pub desired: DesiredInstance,

    /// `None` for instances that do not exist yet.
    #[serde(default)]
    pub existing: Option<ExistingInstance>,

    pub changes: ChangeSet,

    #[serde(default)]
    pub flags: PlanFlags,
}

impl InstancePlan {
    /// `group/uuid (index)`, the name used in logs and errors.
    pub fn label(&self) -> String {
        format!(
            "{}/{} ({})",
            self.desired.group,
            self.instance.label(),
            self.desired.index
        )
    }

    /// Label of the progress task for this plan.
    pub fn task_label(&self, canary: bool) -> String {
        instance_task_label(
            &self.desired.group,
            &self.instance.label(),
            self.desired.index,
            canary,
        )
    }

    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }

    /// The VM cannot be updated in place.
    pub fn needs_recreate(&self) -> bool {
        self.flags.recreate
            || self.flags.recreate_deployment
            || self.changes.contains(ChangeKind::ResourceProfile)
            || self.changes.contains(ChangeKind::Stemcell)
            || self.changes.contains(ChangeKind::Environment)
    }

    /// The state the director recorded, if the instance exists.
    pub fn recorded_state(&self) -> Option<TargetState> {
        self.existing.map(|e| e.state)
    }
}

/// The document pushed to an agent with `prepare` and `apply`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplySpec(serde_json::Value);

impl ApplySpec {
    /// Full spec for a converged instance.
    pub fn full(plan: &InstancePlan, deployment: &str) -> Self {
        let desired = &plan.desired;
        let mut spec = Self::minimal(plan, deployment).0;
        if let Some(map) = spec.as_object_mut() {
            map.insert("id".into(), plan.instance.label().into());
            map.insert(
                "availability_zone".into(),
                serde_json::to_value(&desired.availability_zone).unwrap_or_default(),
            );
            map.insert("stemcell".into(), desired.stemcell.clone().into());
            map.insert("env".into(), desired.env.clone());
            map.insert(
                "jobs".into(),
                serde_json::to_value(&desired.jobs).unwrap_or_default(),
            );
        }
        Self(spec)
    }

    /// Just enough state for a freshly created VM to be recreated again if a
    /// later step fails.
    pub fn minimal(plan: &InstancePlan, deployment: &str) -> Self {
        let desired = &plan.desired;
        let networks: serde_json::Map<String, serde_json::Value> = desired
            .networks
            .iter()
            .map(|n| (n.name.clone(), serde_json::json!({ "ip": n.ip })))
            .collect();

        Self(serde_json::json!({
            "deployment": deployment,
            "job": desired.group,
            "index": desired.index,
            "networks": networks,
            "resource_profile": desired.resource_profile,
            "persistent_disk": desired.persistent_disk.size_mb,
        }))
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn hash(&self) -> SpecHash {
        SpecHash::from_json(&self.0)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn desired(group: &str, index: u32) -> DesiredInstance {
        DesiredInstance {
            group: group.to_string(),
            index,
            availability_zone: None,
            target_state: TargetState::Started,
            resource_profile: "small".to_string(),
            stemcell: "ubuntu-jammy/1.0".to_string(),
            networks: vec![NetworkSettings {
                name: "default".to_string(),
                ip: format!("10.0.0.{}", index + 10),
            }],
            env: serde_json::Value::Null,
            persistent_disk: DiskPolicy::default(),
            jobs: vec!["server".to_string()],
            trusted_certs: String::new(),
            compilation: false,
        }
    }

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
}

#[cfg(test)]
mod tests {
    use super::fixtures::plan;
    use super::*;

    #[test]
    fn test_needs_recreate() {
        assert!(plan("web", 0, &[ChangeKind::ResourceProfile]).needs_recreate());
        assert!(plan("web", 0, &[ChangeKind::Stemcell]).needs_recreate());
        assert!(!plan("web", 0, &[ChangeKind::Network]).needs_recreate());

        let mut forced = plan("web", 0, &[ChangeKind::JobTemplates]);
        forced.flags.recreate = true;
        assert!(forced.needs_recreate());
    }

    #[test]
    fn test_labels() {
        let p = plan("web", 3, &[ChangeKind::Dns]);
        let uuid = p.instance.label();
        assert_eq!(p.label(), format!("web/{uuid} (3)"));
        assert_eq!(p.task_label(true), format!("web/{uuid} (3) (canary)"));
    }

    #[test]
    fn test_apply_spec_shapes() {
        let p = plan("web", 1, &[ChangeKind::JobTemplates]);
        let minimal = ApplySpec::minimal(&p, "prod");
        assert_eq!(minimal.as_json()["deployment"], "prod");
        assert_eq!(minimal.as_json()["networks"]["default"]["ip"], "10.0.0.11");
        assert!(minimal.as_json().get("jobs").is_none());

        let full = ApplySpec::full(&p, "prod");
        assert_eq!(full.as_json()["jobs"][0], "server");
        assert_ne!(full.hash(), minimal.hash());
        assert_eq!(full.hash(), ApplySpec::full(&p, "prod").hash());
    }

    #[test]
    fn test_plan_from_json_defaults() {
        let id = InstanceId::new();
        let plan: InstancePlan = serde_json::from_value(serde_json::json!({
            "instance": id.to_string(),
            "desired": {
                "group": "db",
                "index": 0,
                "target_state": "started",
                "resource_profile": "large",
                "stemcell": "jammy/1.2",
                "persistent_disk": { "size_mb": 1024 }
            },
            "changes": ["persistent_disk"]
        }))
        .unwrap();

        assert_eq!(plan.instance, id);
        assert!(plan.existing.is_none());
        assert!(plan.desired.persistent_disk.needs_disk());
        assert!(!plan.flags.skip_drain);
        assert!(plan.changes.is_only(ChangeKind::PersistentDisk));
    }
}
