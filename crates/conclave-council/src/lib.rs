//! Turn-based, motion/vote-governed meetings for a subset of agents.
//!
//! A [`CouncilEngine`] session collects confirmations from its participants,
//! drains until none of them is mid-execution, then rotates the floor through
//! them for a fixed number of cycles. While a session is live the engine
//! vetoes ordinary queue picks for participants ([`CouncilEngine::evaluate_pick_gate`])
//! and synthesizes a dedicated turn event for the current speaker. Every
//! mutating call is written to a per-tenant ledger.
//!
//! # Main types
//!
//! - [`CouncilEngine`] — Session lifecycle, motions, chair overrides, pick gate.
//! - [`MeetingState`] — The persisted session snapshot.
//! - [`MotionAction`] / [`ChairAction`] — What participants and chairs submit.
//! - [`Resolution`] — Immutable record of an adopted motion.
//! - [`LedgerRow`] — One audit entry.

/// Motion and chair action vocabulary.
pub mod actions;
/// Collaborator interfaces (runtime snapshot, notifier, archive).
pub mod collaborators;
/// Scheduler helper that honours the pick gate.
pub mod dispatch;
/// The engine.
pub mod engine;
mod persistence;
mod procedure;
/// Session, motion, ledger and gate types.
pub mod types;

pub use actions::{ActionKind, ActionWindow, ChairAction, MotionAction};
pub use collaborators::{
    AgentNotifier, IdleRuntime, JsonlArchive, NoopArchive, NoopNotifier, RecordingNotifier,
    ResolutionArchive, RunState, RuntimeSnapshot, StaticRuntime,
};
pub use dispatch::pick_for_agent;
pub use engine::{ActionOutcome, CouncilEngine, CouncilEngineBuilder, StartSession, SYSTEM_ACTOR};
pub use types::{
    Deferral, FloorState, GateReason, LedgerResult, LedgerRow, MeetingState, Motion, MotionRecord,
    MotionState, Phase, PickGate, Resolution, RulesProfile, Tally, VoteChoice, VoteRule,
    RECONSIDER_PREFIX, TURN_EVENT_TYPE,
};
