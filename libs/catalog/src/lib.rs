//! Wire types and async HTTP client for the service catalog.
//!
//! The catalog is the external coordination system the ESM daemon speaks to:
//! a service registry, health store, KV store, and session manager behind a
//! Consul-compatible HTTP API. This crate provides:
//!
//! - Serde wire types matching the catalog's JSON format (`types`)
//! - A typed error (`CatalogError`) distinguishing transient transport
//!   failures from definitive API responses
//! - The async [`Catalog`] trait the daemon consumes, and its HTTP
//!   implementation [`HttpCatalog`] with blocking-query support

mod client;
mod error;
mod types;

pub use client::{Catalog, HttpCatalog, QueryOptions};
pub use error::CatalogError;
pub use types::{
    AgentCheckRegistration, AgentSelf, AgentSelfConfig, AgentService, AgentServiceRegistration,
    CatalogDeregistration, CatalogRegistration, CatalogService, CheckStatus, Coord,
    CoordinateEntry, HealthCheck, HealthCheckDefinition, KvPair, Namespace, Node, SessionBehavior,
    SessionEntry,
};

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, CatalogError>;
