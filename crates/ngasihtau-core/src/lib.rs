//! NgasihTau content-protection foundation: data model, error taxonomy,
//! process configuration, audit trail, and the ports (repositories, blob
//! store, KV, events, catalog access) consumed by the other subsystems.

pub mod access;
pub mod audit;
pub mod blob;
pub mod config;
pub mod error;
pub mod events;
pub mod id;
pub mod kv;
pub mod memory;
pub mod model;
pub mod repo;

pub use config::{Limits, ProtectionConfig, SecretBytes};
pub use error::{ErrorKind, ExternalError, ProtectionError, Result};
pub use id::Id;
