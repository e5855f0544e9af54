//! # rollout-id
//!
//! Identifier types for the rollout director.
//!
//! Two families live here:
//!
//! - Records the director creates (instances, persistent disks, orphan disks,
//!   snapshots, tasks) get a prefixed ULID such as
//!   `pdisk_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The prefix keeps ids of different
//!   record types from being mixed up and the ULID keeps them sortable.
//! - Handles issued by other systems (VM and disk cids from the cloud
//!   provider, agent ids) are opaque non-empty strings.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;
