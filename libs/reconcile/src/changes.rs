//! Change categories computed by the planner for one instance.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// One category of difference between an instance's existing and desired
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Network,
    ResourceProfile,
    Stemcell,
    Environment,
    PersistentDisk,
    Dns,
    TrustedCerts,
    JobTemplates,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Network => "network",
            ChangeKind::ResourceProfile => "resource_profile",
            ChangeKind::Stemcell => "stemcell",
            ChangeKind::Environment => "environment",
            ChangeKind::PersistentDisk => "persistent_disk",
            ChangeKind::Dns => "dns",
            ChangeKind::TrustedCerts => "trusted_certs",
            ChangeKind::JobTemplates => "job_templates",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of change categories for one instance plan.
///
/// An empty set means the plan is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet(BTreeSet<ChangeKind>);

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: ChangeKind) -> bool {
        self.0.insert(kind)
    }

    pub fn contains(&self, kind: ChangeKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if `kind` is the only change.
    pub fn is_only(&self, kind: ChangeKind) -> bool {
        self.0.len() == 1 && self.0.contains(&kind)
    }

    /// True if any change in `self` is also in `other`.
    pub fn intersects(&self, other: &ChangeSet) -> bool {
        self.0.iter().any(|k| other.0.contains(k))
    }

    pub fn iter(&self) -> impl Iterator<Item = ChangeKind> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<ChangeKind> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = ChangeKind>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.0.iter().map(ChangeKind::as_str).collect();
        write!(f, "{}", names.join(", "))
    }
}
