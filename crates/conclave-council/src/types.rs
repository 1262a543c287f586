use chrono::{DateTime, Utc};
use conclave_core::ConclaveError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Event type of the synthesized "your turn" work item.
pub const TURN_EVENT_TYPE: &str = "council_turn";

/// Title prefix reserved for reconsideration motions.
pub const RECONSIDER_PREFIX: &str = "RECONSIDER:";

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for every participant to confirm.
    Collecting,
    /// Everyone confirmed; waiting until no participant is mid-execution.
    Draining,
    /// Turn rotation active.
    InSession,
    /// Suspended by the chair.
    Paused,
    Completed,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Collecting => "collecting",
            Phase::Draining => "draining",
            Phase::InSession => "in_session",
            Phase::Paused => "paused",
            Phase::Completed => "completed",
            Phase::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a motion's ballot is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteRule {
    /// More yes than no.
    SimpleMajority,
    /// Yes at least two thirds of yes+no (abstentions excluded).
    TwoThirds,
}

/// Procedure variant chosen at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulesProfile {
    Standard,
    Supermajority,
    /// Seconded motions skip debate and wait in `seconded`.
    Expedited,
}

impl RulesProfile {
    pub fn vote_rule(self) -> VoteRule {
        match self {
            RulesProfile::Standard | RulesProfile::Expedited => VoteRule::SimpleMajority,
            RulesProfile::Supermajority => VoteRule::TwoThirds,
        }
    }

    pub fn debate_enabled(self) -> bool {
        !matches!(self, RulesProfile::Expedited)
    }
}

impl FromStr for RulesProfile {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(RulesProfile::Standard),
            "supermajority" | "two_thirds" => Ok(RulesProfile::Supermajority),
            "expedited" => Ok(RulesProfile::Expedited),
            other => Err(ConclaveError::Validation(format!(
                "unknown rules profile '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    Yes,
    No,
    Abstain,
}

/// Lifecycle of a single motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionState {
    Proposed,
    Seconded,
    Debating,
    AmendmentPending,
    Voting,
    Adopted,
    Rejected,
    Tabled,
}

impl MotionState {
    pub fn as_str(self) -> &'static str {
        match self {
            MotionState::Proposed => "proposed",
            MotionState::Seconded => "seconded",
            MotionState::Debating => "debating",
            MotionState::AmendmentPending => "amendment_pending",
            MotionState::Voting => "voting",
            MotionState::Adopted => "adopted",
            MotionState::Rejected => "rejected",
            MotionState::Tabled => "tabled",
        }
    }
}

impl fmt::Display for MotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateEntry {
    pub actor: String,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Amendment {
    pub text: String,
    pub proposer: String,
    pub submitted_at: DateTime<Utc>,
}

/// The live proposal. At most one exists per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Motion {
    pub motion_id: String,
    pub title: String,
    pub text: String,
    pub state: MotionState,
    pub proposer: String,
    #[serde(default)]
    pub seconded_by: Option<String>,
    pub vote_rule: VoteRule,
    /// Motion being reconsidered, for reconsideration motions.
    #[serde(default)]
    pub reconsiders: Option<String>,
    #[serde(default)]
    pub debate: Vec<DebateEntry>,
    #[serde(default)]
    pub pending_amendment: Option<Amendment>,
    #[serde(default)]
    pub votes: BTreeMap<String, VoteChoice>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Motion {
    pub fn is_reconsideration(&self) -> bool {
        self.reconsiders.is_some()
    }
}

/// Ballot count for a decided motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub yes: u32,
    pub no: u32,
    pub abstain: u32,
    /// Yes plus no; abstentions do not count.
    pub cast: u32,
    /// Yes votes required for adoption.
    pub needed: u32,
    pub rule: VoteRule,
}

impl Tally {
    pub fn count<'a>(votes: impl IntoIterator<Item = &'a VoteChoice>, rule: VoteRule) -> Self {
        let (mut yes, mut no, mut abstain) = (0u32, 0u32, 0u32);
        for vote in votes {
            match vote {
                VoteChoice::Yes => yes += 1,
                VoteChoice::No => no += 1,
                VoteChoice::Abstain => abstain += 1,
            }
        }
        let cast = yes + no;
        let needed = match rule {
            VoteRule::SimpleMajority => cast / 2 + 1,
            VoteRule::TwoThirds => (2 * cast).div_ceil(3),
        };
        Self {
            yes,
            no,
            abstain,
            cast,
            needed,
            rule,
        }
    }

    pub fn adopted(&self) -> bool {
        match self.rule {
            VoteRule::SimpleMajority => self.yes > self.no,
            VoteRule::TwoThirds => self.cast > 0 && self.yes >= self.needed,
        }
    }
}

/// A motion that left the floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionRecord {
    pub motion_id: String,
    pub title: String,
    pub proposer: String,
    pub outcome: MotionState,
    #[serde(default)]
    pub tally: Option<Tally>,
    #[serde(default)]
    pub resolution_id: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Coarse view of what the floor is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloorState {
    Open,
    MotionPending,
    Debate,
    AmendmentPending,
    Voting,
}

/// Progress of an open ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteState {
    pub motion_id: String,
    pub votes_cast: usize,
    pub votes_required: usize,
}

/// Persisted session state. One per tenant; the next `start_session`
/// replaces a terminal one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingState {
    pub enabled: bool,
    pub session_id: String,
    pub rules_profile: RulesProfile,
    pub phase: Phase,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub agenda: Vec<String>,
    /// Turn ring, in speaking order, without duplicates.
    pub participants: Vec<String>,
    #[serde(default)]
    pub confirmed_agents: Vec<String>,
    pub cycles_total: u32,
    pub cycles_left: u32,
    pub current_index: usize,
    #[serde(default)]
    pub current_speaker: Option<String>,
    #[serde(default)]
    pub current_motion: Option<Motion>,
    pub floor_state: FloorState,
    #[serde(default)]
    pub vote_state: Option<VoteState>,
    #[serde(default)]
    pub deferred_event_ids: Vec<String>,
    #[serde(default)]
    pub resolution_ids: Vec<String>,
    #[serde(default)]
    pub motion_history: Vec<MotionRecord>,
    pub initiator: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl MeetingState {
    pub fn is_participant(&self, agent: &str) -> bool {
        self.participants.iter().any(|p| p == agent)
    }

    pub fn is_speaker(&self, agent: &str) -> bool {
        self.current_speaker.as_deref() == Some(agent)
    }

    /// Enabled and not yet completed or aborted.
    pub fn is_live(&self) -> bool {
        self.enabled && !self.phase.is_terminal()
    }

    pub fn all_confirmed(&self) -> bool {
        self.participants
            .iter()
            .all(|p| self.confirmed_agents.contains(p))
    }

    /// Recompute the derived floor and ballot views from the live motion.
    pub(crate) fn sync_floor(&mut self) {
        self.floor_state = match self.current_motion.as_ref().map(|m| m.state) {
            None => FloorState::Open,
            Some(MotionState::Proposed | MotionState::Seconded) => FloorState::MotionPending,
            Some(MotionState::AmendmentPending) => FloorState::AmendmentPending,
            Some(MotionState::Voting) => FloorState::Voting,
            Some(_) => FloorState::Debate,
        };
        self.vote_state = self
            .current_motion
            .as_ref()
            .filter(|m| m.state == MotionState::Voting)
            .map(|m| VoteState {
                motion_id: m.motion_id.clone(),
                votes_cast: m.votes.keys().filter(|v| self.is_participant(v)).count(),
                votes_required: self.participants.len(),
            });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub task_id: String,
    pub title: String,
    pub owner: String,
    pub status: String,
}

/// Placeholder for an external agreement derived from a resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractStub {
    pub contract_id: String,
    pub parties: Vec<String>,
    pub terms: String,
    pub status: String,
}

/// Immutable record of an adopted motion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolution_id: String,
    pub session_id: String,
    pub motion_id: String,
    pub title: String,
    pub decision: String,
    pub tally: Tally,
    pub obligations: String,
    pub execution_tasks: Vec<ExecutionTask>,
    pub contract: ContractStub,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerResult {
    Ok,
    Error,
}

/// One audit row. Rows are append-only and `seq` is gap-free per tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub actor_id: String,
    pub phase: Option<Phase>,
    pub action_type: String,
    pub target_motion_id: Option<String>,
    pub payload: serde_json::Value,
    pub result: LedgerResult,
    pub error: Option<String>,
}

/// Why the pick gate allowed or vetoed a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    CouncilDisabled,
    NotParticipant,
    Collecting,
    Draining,
    Paused,
    SessionClosed,
    WaitingTurn,
    NotTurnEvent,
    /// A turn event that belongs to another speaker or session.
    ForeignTurn,
    OwnTurn,
}

impl GateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GateReason::CouncilDisabled => "council_disabled",
            GateReason::NotParticipant => "not_participant",
            GateReason::Collecting => "collecting",
            GateReason::Draining => "draining",
            GateReason::Paused => "paused",
            GateReason::SessionClosed => "session_closed",
            GateReason::WaitingTurn => "waiting_turn",
            GateReason::NotTurnEvent => "not_turn_event",
            GateReason::ForeignTurn => "foreign_turn",
            GateReason::OwnTurn => "own_turn",
        }
    }
}

/// Verdict of [`crate::CouncilEngine::evaluate_pick_gate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickGate {
    pub allowed: bool,
    pub reason: GateReason,
    /// The candidate is (now) recorded as deferred for this session.
    pub deferred: bool,
}

impl PickGate {
    pub(crate) fn allow(reason: GateReason) -> Self {
        Self {
            allowed: true,
            reason,
            deferred: false,
        }
    }

    pub(crate) fn deny(reason: GateReason) -> Self {
        Self {
            allowed: false,
            reason,
            deferred: true,
        }
    }

    /// Vetoed without a deferral: the candidate is not this agent's work.
    pub(crate) fn refuse(reason: GateReason) -> Self {
        Self {
            allowed: false,
            reason,
            deferred: false,
        }
    }
}

/// Council-owned record that a queued event was held back during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deferral {
    pub event_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub deferred: bool,
    pub deferred_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}
