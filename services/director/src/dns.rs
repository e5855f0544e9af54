//! DNS record names for instances.

use async_trait::async_trait;
use rollout_id::InstanceId;

use crate::error::CollaboratorError;
use crate::plan::{DesiredInstance, NetworkSettings};

/// Record store the director publishes instance addresses to.
#[async_trait]
pub trait DnsPublisher: Send + Sync {
    async fn upsert_record(&self, domain: &str, name: &str, ip: &str)
        -> Result<(), CollaboratorError>;

    async fn flush_cache(&self) -> Result<(), CollaboratorError>;
}

/// Lowercases and keeps only `[a-z0-9-]`, mapping `_` to `-`.
pub fn canonical(label: &str) -> String {
    label
        .to_lowercase()
        .replace('_', "-")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

/// Index-based and identity-based names of one instance on one network.
pub fn record_names(
    desired: &DesiredInstance,
    instance: &InstanceId,
    network: &NetworkSettings,
    deployment: &str,
    domain: &str,
) -> [String; 2] {
    let suffix = format!(
        "{}.{}.{}.{}",
        canonical(&desired.group),
        canonical(&network.name),
        canonical(deployment),
        domain
    );
    [
        format!("{}.{suffix}", desired.index),
        format!("{}.{suffix}", instance.label()),
    ]
}
