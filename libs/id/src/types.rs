//! Identifier types used by the convergence engine.
//!
//! Director-generated ids are ULID-based and prefixed. Handles issued by the
//! cloud provider or the agent registry are opaque strings.

use crate::{define_handle, define_id};

// =============================================================================
// Director records
// =============================================================================

define_id!(InstanceId, "inst");
define_id!(DiskId, "pdisk");
define_id!(OrphanDiskId, "odisk");
define_id!(SnapshotId, "snap");
define_id!(TaskId, "task");

// =============================================================================
// Provider handles
// =============================================================================

define_handle!(VmCid);
define_handle!(DiskCid);
define_handle!(SnapshotCid);
define_handle!(AgentId);

// =============================================================================
// Events
// =============================================================================

/// Position of a progress event within one task's stream.
///
/// Monotonic per task, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    pub const FIRST: Self = Self(1);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for EventId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(Self)
    }
}
