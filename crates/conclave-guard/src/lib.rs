//! Concurrency and rate limiting for calls to a scarce external resource.
//!
//! Before an outbound call, take a [`Ticket`] from the shared
//! [`ConcurrencyGuard`]; dropping it (or calling [`Ticket::release`]) frees
//! the slot. Admission checks four limits under one mutex: global and
//! per-tenant in-flight calls, and global and per-tenant calls started in the
//! last 60 seconds. Callers block until admitted or until the acquire
//! timeout elapses.
//!
//! # Main types
//!
//! - [`ConcurrencyGuard`] — The limiter, cheap to clone and share.
//! - [`Ticket`] — An admitted call.
//! - [`LimitsSource`] — Where limits come from ([`StaticLimits`], [`LiveLimits`]).
//! - [`GuardConfigWatcher`] — Hot reload of the `[guard]` config section.

/// The limiter and its tickets.
pub mod guard;
/// Limit sources.
pub mod limits;
/// Config file hot reload.
pub mod reload;

pub use guard::{ConcurrencyGuard, GuardSnapshot, Ticket, RATE_WINDOW};
pub use limits::{LimitsSource, LiveLimits, StaticLimits};
pub use reload::{reload_limits, GuardConfigWatcher};
