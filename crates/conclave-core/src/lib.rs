//! Core types shared by the Conclave coordination crates.
//!
//! # Main types
//!
//! - [`ConclaveError`] — Unified error enum for the queue, council and guard.
//! - [`ConclaveResult`] — Convenience alias for `Result<T, ConclaveError>`.
//! - [`Clock`] — Injected time source ([`SystemClock`], [`ManualClock`]).
//! - [`TenantDatabases`] — One SQLite file per tenant with a single-writer lock.
//! - [`ConclaveConfig`] — TOML configuration model.

/// Time source abstraction.
pub mod clock;
/// Configuration model and loader.
pub mod config;
/// Error types.
pub mod error;
/// Tenant id validation and per-tenant storage.
pub mod tenant;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    load_config, parse_config, ConclaveConfig, CouncilConfig, GuardConfig, QueueConfig,
    StorageConfig,
};
pub use error::{ConclaveError, ConclaveResult};
pub use tenant::{validate_tenant, TenantDatabases};

/// JSON object used for payloads, metadata and ledger details.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
