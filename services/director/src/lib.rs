//! Rollout director library
//!
//! Converges instance groups towards their planned state: canaries first,
//! then the rest, bounded by max-in-flight and halted by the first failure.
//!
//! ## Modules
//!
//! - `rollout`: canary and bulk phases for one instance group
//! - `instance_updater`: the per-instance convergence state machine
//! - `drain`: drain classification and the static/dynamic drain protocol
//! - `disk`: persistent disk reconciliation and migration
//! - `store`: SQLite records for instances, VMs, disks and orphans
//! - `sim`: simulated cloud, agents and collaborators

pub mod agent;
pub mod cancel;
pub mod clock;
pub mod cloud;
pub mod collaborators;
pub mod config;
pub mod disk;
pub mod dns;
pub mod drain;
pub mod error;
pub mod instance_updater;
pub mod plan;
pub mod progress;
pub mod rollout;
pub mod sim;
pub mod store;
pub mod vm;

pub use config::DirectorConfig;
pub use error::UpdateError;
pub use instance_updater::{ConvergenceReport, InstanceUpdater};
pub use rollout::{Converge, GroupRollout, RolloutError, RolloutReport, RolloutScheduler};
