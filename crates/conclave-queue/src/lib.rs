//! Durable per-tenant priority work queue.
//!
//! Producers [`EventStore::append`] work items; schedulers call
//! [`EventStore::pick_next`] per tenant and domain. Records move through an
//! explicit state machine ([`EventState`]) with bounded retries,
//! dead-lettering, idempotent enqueue and stale-work recovery.
//!
//! # Main types
//!
//! - [`EventStore`] — The queue itself, one SQLite file per tenant.
//! - [`EventRecord`] — A stored unit of work.
//! - [`NewEvent`] — Builder for records to append.
//! - [`PickRequest`] — Domain, cooldown lane and owner filter for a pick.
//! - [`EnqueueHook`] — Best-effort callback after an append commits.

/// Enqueue hooks.
pub mod hooks;
/// The SQLite-backed store.
pub mod store;
/// Records, states and request types.
pub mod types;

pub use hooks::EnqueueHook;
pub use store::EventStore;
pub use types::{
    ErrorInfo, EventFilter, EventRecord, EventState, NewEvent, PickRequest, ReconcileReport,
    MAX_SPAN_SECS, PROCESSING_TIMEOUT, RESERVED_PAYLOAD_KEYS,
};
