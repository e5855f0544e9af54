//! Rollout primitives.
//!
//! Pure building blocks used by the director to converge an instance group:
//!
//! - **Update config**: canary count, concurrency bound and watch ranges,
//!   in the forms operators write them (`2`, `"50%"`, `"1000-5000"`).
//! - **Change sets**: the categories of difference between existing and
//!   desired state for one instance.
//! - **Watch schedule**: the poll delays used after an instance was started.
//! - **Drain time**: interpretation of the signed drain answer of an agent.
//! - **Batching**: canary selection and availability-zone grouping.
//!
//! # Invariants
//!
//! - Nothing here performs I/O or reads ambient state
//! - Results are deterministic given the same inputs

mod batching;
mod changes;
mod drain;
mod update_config;
mod watch;

pub use batching::{group_by_zone, partition_canaries};
pub use changes::{ChangeKind, ChangeSet};
pub use drain::{DrainKind, DrainStep, DrainTime};
pub use update_config::{Quantity, UpdateConfig, WatchRange};
pub use watch::{watch_schedule, DEFAULT_WATCH_INTERVALS, MAX_WATCH_INTERVALS};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Rollout configuration errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A canary or max-in-flight value that is neither a count nor a percentage.
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    /// A watch time that is not `min-max` milliseconds with `min <= max`.
    #[error("invalid watch range: {0}")]
    InvalidWatchRange(String),
}

/// Fingerprint of an applied instance spec.
///
/// Recorded on the VM once state has been applied, so a re-run can tell which
/// spec an instance last received.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Hash of the canonical JSON form (sorted keys, no whitespace).
    pub fn from_json(json: &serde_json::Value) -> Self {
        let mut canonical = String::new();
        write_canonical(json, &mut canonical);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("sha256:{}", hex::encode(digest)))
    }

    /// Wraps a previously recorded fingerprint.
    pub fn from_recorded(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already serialize canonically.
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_hash_ignores_key_order() {
        let a = serde_json::json!({"b": 2, "a": {"y": [1, "x"], "x": null}});
        let b = serde_json::json!({"a": {"x": null, "y": [1, "x"]}, "b": 2});
        assert_eq!(SpecHash::from_json(&a), SpecHash::from_json(&b));
    }

    #[test]
    fn test_spec_hash_changes_with_content() {
        let a = serde_json::json!({"job": "web", "index": 0});
        let b = serde_json::json!({"job": "web", "index": 1});
        let hash = SpecHash::from_json(&a);
        assert_ne!(hash, SpecHash::from_json(&b));
        assert!(hash.as_str().starts_with("sha256:"));
        assert_eq!(hash.as_str().len(), "sha256:".len() + 64);
    }

    #[test]
    fn test_spec_hash_escapes_keys() {
        let a = serde_json::json!({"a\"b": 1});
        let b = serde_json::json!({"a": 1});
        assert_ne!(SpecHash::from_json(&a), SpecHash::from_json(&b));
    }
}
