//! # rollout-events
//!
//! Progress events produced while a fleet is converged.
//!
//! ## Design Principles
//!
//! - Events are append-only observations; nothing in the engine reads them back
//! - Every task in a stage reports `started`, then `finished` or `failed`
//! - Event ids are monotonic within one convergence task
//!
//! The consumer (a reporting layer, the CLI, a log shipper) decides how to
//! render them. The director emits them as JSON lines.

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
