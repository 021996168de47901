//! warden-core: interception decisions, event generation and delivery for
//! the Warden endpoint sensor.
//!
//! The OS adapter calls the traits in `interceptor`; everything behind them
//! is platform independent.
//!
//! # Modules
//! - `lbvs`: binary record codec used for events and control payloads
//! - `rules`: file, registry and process rule store
//! - `process`: per-process contexts and the option cascade
//! - `*_monitor`: the four interception front ends
//! - `delivery`: bounded queue and the consumer worker
//! - `control`: control command dispatch
//! - `engine`: wires it all together

pub mod access;
pub mod clock;
pub mod config;
pub mod config_store;
pub mod control;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod events;
pub mod file_monitor;
pub mod hashing;
pub mod interceptor;
pub mod lbvs;
pub mod object_monitor;
pub mod process;
pub mod process_monitor;
pub mod protocol;
pub mod queue;
pub mod reg_path;
pub mod registry_monitor;
pub mod repeat_filter;
pub mod rules;
pub mod state;

#[cfg(unix)]
pub mod ipc;
#[cfg(unix)]
pub mod ipc_client;
pub mod paths;

#[cfg(test)]
mod testutil;

pub use engine::{Engine, EngineOptions, EngineStatus};
pub use error::{EngineError, EngineResult};
pub use lbvs::{CodecError, LbvsReader, LbvsWriter};
