//! Core distributed co-simulation runtime: the master execution engine,
//! the slave agent, the variable pub/sub fabric, and the slave-provider
//! discovery layer. See `SPEC_FULL.md` for the full design.

// === Public Modules (The Canonical Paths) ===
pub mod agent;
pub mod capability;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod error;
pub mod execution;
pub mod facade;
pub mod model;
pub mod provider;
pub mod pubsub;
pub mod transport;
pub mod wire;

// === Private Implementation Details ===
mod controller;
mod macros;
mod messenger;
mod reactor;

// === Facades (Re-exporting internals) ===
pub use crate::facade::Execution;
pub use crate::reactor::{Reactor, ReactorStopper};
