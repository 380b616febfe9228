//! Common building blocks for the hydrogen broker.
//!
//! This crate holds the pieces of the broker that have no knowledge of the
//! property protocol itself:
//!
//! - [`SafeRegistry`]: slot arena handing out generation-checked ids and
//!   [`Heartbeat`] liveness tokens, so background work can detect that the
//!   object it refers to was removed concurrently
//! - [`RestartWindow`]: sliding-window bookkeeping of unexpected driver exits
//! - [`process`]: the [`ChildProcess`] abstraction (spawn, kill, wait,
//!   stderr capture) used to supervise local drivers
//! - [`error`]: error types shared by the above
//!
//! # Example
//!
//! ```
//! use hydrogen_common::SafeRegistry;
//!
//! let mut peers: SafeRegistry<&str> = SafeRegistry::new();
//! let id = peers.insert("camera-client");
//! let heartbeat = peers.heartbeat(id).unwrap();
//!
//! assert!(heartbeat.alive());
//! peers.erase(id);
//! assert!(!heartbeat.alive());
//! ```

pub mod error;
pub mod process;
mod registry;
mod restart;

pub use error::{CommonError, CommonResult};
pub use process::{ChildProcess, ExitOutcome, ProcessSpec};
pub use registry::{EntryId, Heartbeat, SafeRegistry};
pub use restart::{RestartDecision, RestartWindow};
