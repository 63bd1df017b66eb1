//! consul-esm: external service monitor.
//!
//! A daemon that health-checks services living outside the orchestrated
//! fleet. Instances register themselves with the catalog, agree on a
//! roster, deterministically shard the external nodes and checks among
//! themselves, probe what they own, and write the results back.

pub mod agent;
pub mod backoff;
pub mod compat;
pub mod config;
pub mod coordinate;
pub mod coordinator;
pub mod error;
pub mod probes;
pub mod reconcile;
pub mod status;

pub use agent::Agent;
pub use config::Config;
pub use error::{ErrorKind, EsmError};
