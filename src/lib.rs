//! Swarm coordination daemon.
//!
//! One process per host. Exactly one of them is the controller; the others
//! are nodes that register with it.  The controller keeps the membership
//! list, prunes members that stop answering health checks, and pushes the
//! list to every node.  Any member may start a two-phase update that stages
//! a new package everywhere and applies it only once every node prepared.
//!
//! Configuration is read from `swarmd.toml`, `swarmd.json` and `SWARMD_*`
//! environment variables, in that order.

pub mod api;
pub mod config;
pub mod error;
pub mod gate;
pub mod health;
pub mod membership;
pub mod service;
pub mod tickets;
pub mod transport;
pub mod types;
pub mod updater;

pub use config::Config;
pub use error::{Result, SwarmError};
pub use service::{RegistrationResult, SwarmService, UpdateOutcome};
pub use updater::{StagingDirectoryUpdater, UpdateApplier};
