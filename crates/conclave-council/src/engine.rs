use crate::actions::{
    allowed_actions, allowed_chair_actions, ActionWindow, ChairAction, MotionAction,
};
use crate::collaborators::{
    AgentNotifier, IdleRuntime, NoopArchive, NoopNotifier, ResolutionArchive, RunState,
    RuntimeSnapshot,
};
use crate::persistence::{self, LedgerEntry};
use crate::procedure::{self, Effect, Step};
use crate::types::{
    Deferral, FloorState, GateReason, LedgerRow, MeetingState, MotionState, Phase, PickGate,
    Resolution, RulesProfile, Tally, TURN_EVENT_TYPE,
};
use conclave_core::{
    Clock, ConclaveConfig, ConclaveError, ConclaveResult, CouncilConfig, TenantDatabases,
};
use conclave_queue::{EventFilter, EventRecord, EventState, EventStore, NewEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Actor recorded for calls the scheduler makes on its own behalf.
pub const SYSTEM_ACTOR: &str = "system";

const MAX_PAGE: usize = 1_000;

/// Parameters of [`CouncilEngine::start_session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSession {
    /// Generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub agenda: Vec<String>,
    /// Speaking order. Duplicates are dropped, first occurrence wins.
    pub participants: Vec<String>,
    #[serde(default = "default_cycles")]
    pub cycles: u32,
    /// Falls back to `council.default_rules_profile`.
    #[serde(default)]
    pub rules_profile: Option<String>,
    pub initiator: String,
}

fn default_cycles() -> u32 {
    1
}

impl StartSession {
    pub fn new<I, S>(title: impl Into<String>, initiator: impl Into<String>, participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            session_id: None,
            title: title.into(),
            content: String::new(),
            agenda: Vec::new(),
            participants: participants.into_iter().map(Into::into).collect(),
            cycles: default_cycles(),
            rules_profile: None,
            initiator: initiator.into(),
        }
    }

    pub fn with_cycles(mut self, cycles: u32) -> Self {
        self.cycles = cycles;
        self
    }

    pub fn with_rules_profile(mut self, profile: impl Into<String>) -> Self {
        self.rules_profile = Some(profile.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_agenda<I, S>(mut self, agenda: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agenda = agenda.into_iter().map(Into::into).collect();
        self
    }
}

/// Result of [`CouncilEngine::submit_action`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub state: MeetingState,
    /// `adopted` or `rejected` when this action closed a ballot.
    pub decision: Option<MotionState>,
    pub tally: Option<Tally>,
    pub resolution: Option<Resolution>,
}

/// Persisted, audited, turn-based meeting protocol for a subset of agents.
///
/// Each tenant has one council database holding the latest session
/// snapshot, the ledger, resolutions and deferrals. Every call loads, mutates
/// and saves under the tenant's write lock, so council operations within a
/// tenant are serializable. Turn events, wake-ups and archive writes happen
/// after the commit and never roll it back.
pub struct CouncilEngine {
    dbs: TenantDatabases,
    events: Arc<EventStore>,
    config: CouncilConfig,
    clock: Arc<dyn Clock>,
    runtime: Arc<dyn RuntimeSnapshot>,
    notifier: Arc<dyn AgentNotifier>,
    archive: Arc<dyn ResolutionArchive>,
}

/// Builder for [`CouncilEngine`].
pub struct CouncilEngineBuilder {
    dir: PathBuf,
    events: Arc<EventStore>,
    config: CouncilConfig,
    busy_timeout_ms: u64,
    clock: Option<Arc<dyn Clock>>,
    runtime: Arc<dyn RuntimeSnapshot>,
    notifier: Arc<dyn AgentNotifier>,
    archive: Arc<dyn ResolutionArchive>,
}

impl CouncilEngineBuilder {
    pub fn config(mut self, config: CouncilConfig) -> Self {
        self.config = config;
        self
    }

    pub fn busy_timeout_ms(mut self, ms: u64) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    /// Defaults to the event store's clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn RuntimeSnapshot>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn AgentNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn archive(mut self, archive: Arc<dyn ResolutionArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn build(self) -> ConclaveResult<CouncilEngine> {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::clone(self.events.clock()));
        Ok(CouncilEngine {
            dbs: TenantDatabases::open(self.dir, persistence::SCHEMA, self.busy_timeout_ms)?,
            events: self.events,
            config: self.config,
            clock,
            runtime: self.runtime,
            notifier: self.notifier,
            archive: self.archive,
        })
    }
}

impl CouncilEngine {
    /// Start building an engine whose tenant databases live in `dir`.
    pub fn builder(dir: impl Into<PathBuf>, events: Arc<EventStore>) -> CouncilEngineBuilder {
        CouncilEngineBuilder {
            dir: dir.into(),
            events,
            config: CouncilConfig::default(),
            busy_timeout_ms: 5_000,
            clock: None,
            runtime: Arc::new(IdleRuntime),
            notifier: Arc::new(NoopNotifier),
            archive: Arc::new(NoopArchive),
        }
    }

    /// Builder preloaded from the `[storage]` and `[council]` sections.
    pub fn from_config(config: &ConclaveConfig, events: Arc<EventStore>) -> CouncilEngineBuilder {
        Self::builder(config.storage.council_dir(), events)
            .config(config.council.clone())
            .busy_timeout_ms(config.storage.busy_timeout_ms)
    }

    pub fn config(&self) -> &CouncilConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    /// The session initiator and the configured chair ids hold chair privileges.
    pub fn is_chair(&self, state: &MeetingState, actor: &str) -> bool {
        state.initiator == actor || self.config.chair_ids.iter().any(|c| c == actor)
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Open a new session in `collecting`. Fails while another session is live.
    pub fn start_session(&self, tenant: &str, request: StartSession) -> ConclaveResult<MeetingState> {
        let payload = serde_json::to_value(&request)?;
        let actor = request.initiator.clone();
        let (_, state) = self.execute(tenant, &actor, "start_session", payload, |step, state| {
            if !self.config.enabled {
                return Err(ConclaveError::Validation("council is disabled".into()));
            }
            if let Some(live) = state.as_ref().filter(|s| s.is_live()) {
                return Err(ConclaveError::Validation(format!(
                    "session {} is still {}",
                    live.session_id, live.phase
                )));
            }
            let title = request.title.trim();
            if title.is_empty() {
                return Err(ConclaveError::Validation("title must not be empty".into()));
            }
            if request.initiator.trim().is_empty() {
                return Err(ConclaveError::Validation("initiator must not be empty".into()));
            }
            if request.cycles == 0 {
                return Err(ConclaveError::Validation("cycles must be at least 1".into()));
            }
            let mut participants: Vec<String> = Vec::new();
            for p in &request.participants {
                let p = p.trim();
                if !p.is_empty() && !participants.iter().any(|q| q == p) {
                    participants.push(p.to_string());
                }
            }
            if participants.is_empty() {
                return Err(ConclaveError::Validation(
                    "a session needs at least one participant".into(),
                ));
            }
            let rules_profile: RulesProfile = request
                .rules_profile
                .as_deref()
                .unwrap_or(self.config.default_rules_profile.as_str())
                .parse()?;

            let session = MeetingState {
                enabled: true,
                session_id: request
                    .session_id
                    .clone()
                    .unwrap_or_else(|| format!("sess_{}", Uuid::new_v4().simple())),
                rules_profile,
                phase: Phase::Collecting,
                title: title.to_string(),
                content: request.content.clone(),
                agenda: request.agenda.clone(),
                participants,
                confirmed_agents: Vec::new(),
                cycles_total: request.cycles,
                cycles_left: request.cycles,
                current_index: 0,
                current_speaker: None,
                current_motion: None,
                floor_state: FloorState::Open,
                vote_state: None,
                deferred_event_ids: Vec::new(),
                resolution_ids: Vec::new(),
                motion_history: Vec::new(),
                initiator: request.initiator.clone(),
                created_at: step.now,
                updated_at: step.now,
                started_at: None,
                ended_at: None,
            };
            for participant in &session.participants {
                step.effects.push(Effect::Wake(participant.clone()));
            }
            info!(
                tenant = %tenant,
                session_id = %session.session_id,
                participants = session.participants.len(),
                cycles = session.cycles_total,
                profile = ?session.rules_profile,
                "council session opened"
            );
            *state = Some(session);
            Ok(())
        })?;
        Self::require(state)
    }

    /// Record that `agent_id` is ready. Once everyone is, the session drains
    /// and starts as soon as no participant is mid-execution.
    pub fn confirm_participant(&self, tenant: &str, agent_id: &str) -> ConclaveResult<MeetingState> {
        let payload = json!({ "agent_id": agent_id });
        let (_, state) =
            self.execute(tenant, agent_id, "confirm_participant", payload, |step, state| {
                let session = Self::live(state)?;
                if !session.is_participant(agent_id) {
                    return Err(ConclaveError::Validation(format!(
                        "{agent_id} is not a participant of session {}",
                        session.session_id
                    )));
                }
                if session.confirmed_agents.iter().any(|a| a == agent_id) {
                    debug!(session_id = %session.session_id, agent = %agent_id, "already confirmed");
                } else {
                    session.confirmed_agents.push(agent_id.to_string());
                }
                if session.phase == Phase::Collecting && session.all_confirmed() {
                    session.phase = Phase::Draining;
                    info!(session_id = %session.session_id, "all participants confirmed, draining");
                    if let Some(run_states) = self.run_states(tenant) {
                        procedure::try_begin(session, step, &run_states);
                    }
                }
                Ok(())
            })?;
        Self::require(state)
    }

    /// Periodic driver: starts a draining session once its participants are
    /// idle. Audited only when it changes the session.
    pub fn tick(&self, tenant: &str) -> ConclaveResult<Option<MeetingState>> {
        let (_, state) =
            self.execute(tenant, SYSTEM_ACTOR, "tick", serde_json::Value::Null, |step, state| {
                step.changed = false;
                if let Some(session) = state
                    .as_mut()
                    .filter(|s| s.is_live() && s.phase == Phase::Draining)
                {
                    if let Some(run_states) = self.run_states(tenant) {
                        step.changed = procedure::try_begin(session, step, &run_states);
                    }
                }
                Ok(())
            })?;
        Ok(state)
    }

    /// An agent finished a pulse. If it held the floor, the turn passes on.
    pub fn note_pulse_finished(
        &self,
        tenant: &str,
        agent_id: &str,
    ) -> ConclaveResult<Option<MeetingState>> {
        let payload = json!({ "agent_id": agent_id });
        let (_, state) =
            self.execute(tenant, agent_id, "note_pulse_finished", payload, |step, state| {
                step.changed = false;
                if let Some(session) = state.as_mut().filter(|s| {
                    s.is_live() && s.phase == Phase::InSession && s.is_speaker(agent_id)
                }) {
                    step.target_motion_id =
                        session.current_motion.as_ref().map(|m| m.motion_id.clone());
                    procedure::advance_turn(session, step)?;
                    step.changed = true;
                }
                Ok(())
            })?;
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Scheduling gate
    // ------------------------------------------------------------------

    /// Decide whether `agent_id` may pick `candidate` right now.
    ///
    /// Agents outside a live session are never vetoed. Participants only get
    /// their own turn event while holding the floor; everything else is
    /// denied and recorded as deferred until the session ends. A turn event
    /// addressed to another speaker or session is refused without a deferral.
    pub fn evaluate_pick_gate(
        &self,
        tenant: &str,
        agent_id: &str,
        candidate: &EventRecord,
    ) -> ConclaveResult<PickGate> {
        if !self.config.enabled {
            return Ok(PickGate::allow(GateReason::CouncilDisabled));
        }
        let payload = json!({
            "event_id": candidate.event_id,
            "event_type": candidate.event_type,
        });
        let (gate, _) =
            self.execute(tenant, agent_id, "evaluate_pick_gate", payload, |step, state| {
                step.changed = false;
                let Some(session) = state.as_mut().filter(|s| s.is_live()) else {
                    return Ok(PickGate::allow(GateReason::CouncilDisabled));
                };
                if !session.is_participant(agent_id) {
                    return Ok(PickGate::allow(GateReason::NotParticipant));
                }
                let gate = match session.phase {
                    Phase::Collecting => PickGate::deny(GateReason::Collecting),
                    Phase::Draining => PickGate::deny(GateReason::Draining),
                    Phase::Paused => PickGate::deny(GateReason::Paused),
                    Phase::Completed | Phase::Aborted => PickGate::deny(GateReason::SessionClosed),
                    Phase::InSession if !session.is_speaker(agent_id) => {
                        PickGate::deny(GateReason::WaitingTurn)
                    }
                    Phase::InSession if candidate.event_type != TURN_EVENT_TYPE => {
                        PickGate::deny(GateReason::NotTurnEvent)
                    }
                    Phase::InSession if !Self::is_turn_of(session, agent_id, candidate) => {
                        PickGate::refuse(GateReason::ForeignTurn)
                    }
                    Phase::InSession => PickGate::allow(GateReason::OwnTurn),
                };
                if gate.deferred
                    && persistence::defer_event(
                        step.conn,
                        &candidate.event_id,
                        &session.session_id,
                        agent_id,
                        step.now,
                    )?
                {
                    session.deferred_event_ids.push(candidate.event_id.clone());
                    step.changed = true;
                    debug!(
                        tenant = %tenant,
                        agent = %agent_id,
                        event_id = %candidate.event_id,
                        reason = gate.reason.as_str(),
                        "event deferred"
                    );
                }
                Ok(gate)
            })?;
        Ok(gate)
    }

    // ------------------------------------------------------------------
    // Motions and chair overrides
    // ------------------------------------------------------------------

    /// Apply a motion action for `actor`. Rejected actions are still audited.
    pub fn submit_action(
        &self,
        tenant: &str,
        actor: &str,
        action: MotionAction,
    ) -> ConclaveResult<ActionOutcome> {
        let payload = serde_json::to_value(&action)?;
        let action_type = action.kind().as_str();
        let (decision, state) = self.execute(tenant, actor, action_type, payload, |step, state| {
            step.target_motion_id = match &action {
                MotionAction::ReconsiderSubmit {
                    target_motion_id, ..
                } => Some(target_motion_id.clone()),
                _ => state
                    .as_ref()
                    .and_then(|s| s.current_motion.as_ref())
                    .map(|m| m.motion_id.clone()),
            };
            let session = Self::live(state)?;
            let is_chair = self.is_chair(session, actor);
            procedure::apply_motion_action(
                session,
                actor,
                is_chair,
                action,
                self.config.debate_log_cap,
                step,
            )
        })?;
        let state = Self::require(state)?;
        Ok(match decision {
            Some(d) => ActionOutcome {
                state,
                decision: Some(d.outcome),
                tally: Some(d.tally),
                resolution: d.resolution,
            },
            None => ActionOutcome {
                state,
                decision: None,
                tally: None,
                resolution: None,
            },
        })
    }

    /// Apply a privileged chair override.
    pub fn chair_action(
        &self,
        tenant: &str,
        actor: &str,
        action: ChairAction,
    ) -> ConclaveResult<MeetingState> {
        let payload = serde_json::to_value(&action)?;
        let action_type = format!("chair_{}", action.name());
        let (_, state) = self.execute(tenant, actor, &action_type, payload, |step, state| {
            let session = state
                .as_mut()
                .ok_or_else(|| ConclaveError::Validation("no council session".into()))?;
            if !self.is_chair(session, actor) {
                return Err(ConclaveError::Validation(format!(
                    "{actor} is not a chair of session {}",
                    session.session_id
                )));
            }
            if !session.is_live() {
                return Err(ConclaveError::Validation(format!(
                    "session {} is already {}",
                    session.session_id, session.phase
                )));
            }
            step.target_motion_id = session.current_motion.as_ref().map(|m| m.motion_id.clone());
            let phase = session.phase;
            match action {
                ChairAction::Pause => {
                    if phase != Phase::InSession {
                        return Err(ConclaveError::Validation(format!(
                            "cannot pause a session that is {phase}"
                        )));
                    }
                    session.phase = Phase::Paused;
                    info!(session_id = %session.session_id, chair = %actor, "session paused");
                }
                ChairAction::Resume => {
                    if phase != Phase::Paused {
                        return Err(ConclaveError::Validation(format!(
                            "cannot resume a session that is {phase}"
                        )));
                    }
                    session.phase = Phase::InSession;
                    info!(session_id = %session.session_id, chair = %actor, "session resumed");
                    procedure::announce_turn(session, step);
                }
                ChairAction::Terminate { reason } => {
                    info!(session_id = %session.session_id, chair = %actor, reason = ?reason, "session terminated");
                    procedure::finish(session, step, Phase::Aborted)?;
                }
                ChairAction::SkipTurn => {
                    if phase != Phase::InSession {
                        return Err(ConclaveError::Validation(format!(
                            "cannot skip a turn while {phase}"
                        )));
                    }
                    info!(session_id = %session.session_id, skipped = ?session.current_speaker, "turn skipped");
                    procedure::advance_turn(session, step)?;
                }
                ChairAction::RemoveParticipant { agent_id } => {
                    procedure::remove_participant(session, &agent_id, step)?;
                }
            }
            Ok(())
        })?;
        Self::require(state)
    }

    // ------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------

    pub fn get_state(&self, tenant: &str) -> ConclaveResult<Option<MeetingState>> {
        self.dbs.read(tenant, persistence::load_state)
    }

    /// What `actor` may do right now in the tenant's session.
    pub fn action_window(&self, tenant: &str, actor: &str) -> ConclaveResult<ActionWindow> {
        let state = self.get_state(tenant)?;
        let Some(state) = state else {
            return Ok(ActionWindow {
                session_id: None,
                phase: None,
                actor: actor.to_string(),
                is_participant: false,
                is_chair: false,
                is_speaker: false,
                current_speaker: None,
                motion_id: None,
                motion_state: None,
                allowed_actions: Vec::new(),
                chair_actions: Vec::new(),
            });
        };
        let is_chair = self.is_chair(&state, actor);
        Ok(ActionWindow {
            session_id: Some(state.session_id.clone()),
            phase: Some(state.phase),
            actor: actor.to_string(),
            is_participant: state.is_participant(actor),
            is_chair,
            is_speaker: state.is_speaker(actor),
            current_speaker: state.current_speaker.clone(),
            motion_id: state.current_motion.as_ref().map(|m| m.motion_id.clone()),
            motion_state: state.current_motion.as_ref().map(|m| m.state),
            allowed_actions: allowed_actions(&state, actor, is_chair),
            chair_actions: if is_chair {
                allowed_chair_actions(&state)
            } else {
                Vec::new()
            },
        })
    }

    /// Ledger rows with `seq > since_seq`, oldest first.
    pub fn list_ledger(
        &self,
        tenant: &str,
        since_seq: u64,
        limit: usize,
    ) -> ConclaveResult<Vec<LedgerRow>> {
        let limit = limit.clamp(1, MAX_PAGE);
        self.dbs
            .read(tenant, |conn| persistence::list_ledger(conn, since_seq, limit))
    }

    /// Adopted resolutions, oldest first, optionally for one session.
    pub fn list_resolutions(
        &self,
        tenant: &str,
        session_id: Option<&str>,
        limit: usize,
    ) -> ConclaveResult<Vec<Resolution>> {
        let limit = limit.clamp(1, MAX_PAGE);
        self.dbs
            .read(tenant, |conn| persistence::list_resolutions(conn, session_id, limit))
    }

    pub fn deferrals(&self, tenant: &str) -> ConclaveResult<Vec<Deferral>> {
        self.dbs.read(tenant, persistence::list_deferrals)
    }

    pub fn is_deferred(&self, tenant: &str, event_id: &str) -> ConclaveResult<bool> {
        self.dbs
            .read(tenant, |conn| persistence::is_deferred(conn, event_id))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn require(state: Option<MeetingState>) -> ConclaveResult<MeetingState> {
        state.ok_or_else(|| ConclaveError::NotFound("council session".into()))
    }

    fn live(state: &mut Option<MeetingState>) -> ConclaveResult<&mut MeetingState> {
        state
            .as_mut()
            .filter(|s| s.is_live())
            .ok_or_else(|| ConclaveError::Validation("no active council session".into()))
    }

    /// A turn event addressed to `agent_id` for this very session.
    fn is_turn_of(session: &MeetingState, agent_id: &str, candidate: &EventRecord) -> bool {
        candidate.owner.as_deref() == Some(agent_id)
            && candidate
                .payload
                .get("session_id")
                .and_then(serde_json::Value::as_str)
                == Some(session.session_id.as_str())
    }

    /// `None` when the runtime cannot be asked; the session keeps draining.
    fn run_states(&self, tenant: &str) -> Option<HashMap<String, RunState>> {
        match self.runtime.run_states(tenant) {
            Ok(states) => Some(states),
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "runtime snapshot unavailable");
                None
            }
        }
    }

    /// Run one council call under the tenant's write lock.
    ///
    /// `f` runs inside a savepoint: on error its writes are rolled back but
    /// the ledger row recording the failure still commits. The session is
    /// saved and the call audited when `f` fails or leaves `step.changed`
    /// set. Effects run only after a successful commit.
    fn execute<T>(
        &self,
        tenant: &str,
        actor: &str,
        action_type: &str,
        payload: serde_json::Value,
        f: impl FnOnce(&mut Step<'_>, &mut Option<MeetingState>) -> ConclaveResult<T>,
    ) -> ConclaveResult<(T, Option<MeetingState>)> {
        let now = self.clock.now();
        let (result, effects) = self.dbs.write(tenant, |conn| {
            let mut state = persistence::load_state(conn)?;
            let phase = state.as_ref().map(|s| s.phase);
            let mut step = Step::new(conn, now);

            conn.execute_batch("SAVEPOINT council_action")?;
            let result = match f(&mut step, &mut state) {
                Ok(value) => {
                    if step.changed {
                        if let Some(session) = state.as_mut() {
                            session.updated_at = now;
                            session.sync_floor();
                            persistence::save_state(conn, session)?;
                        }
                    }
                    conn.execute_batch("RELEASE council_action")?;
                    Ok((value, state))
                }
                Err(e) => {
                    conn.execute_batch("ROLLBACK TO council_action; RELEASE council_action")?;
                    step.effects.clear();
                    step.changed = true;
                    warn!(tenant = %tenant, actor = %actor, action = %action_type, error = %e, "council action rejected");
                    Err(e)
                }
            };

            if step.changed {
                let seq = persistence::append_ledger(
                    conn,
                    LedgerEntry {
                        ts: now,
                        actor_id: actor,
                        phase,
                        action_type,
                        target_motion_id: step.target_motion_id.as_deref(),
                        payload: &payload,
                        error: result.as_ref().err().map(ToString::to_string),
                    },
                )?;
                debug!(tenant = %tenant, seq, action = %action_type, "ledger row appended");
            }
            Ok((result, std::mem::take(&mut step.effects)))
        })?;

        if result.is_ok() {
            self.run_effects(tenant, effects);
        }
        result
    }

    fn run_effects(&self, tenant: &str, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Turn {
                    session_id,
                    speaker,
                    cycles_left,
                    index,
                } => {
                    let event = NewEvent::new(tenant, &self.config.turn_domain, TURN_EVENT_TYPE)
                        .with_priority(self.config.turn_priority)
                        .with_owner(speaker.clone())
                        .with_dedupe_key(format!("{session_id}:{speaker}:{cycles_left}:{index}"))
                        .with_payload(json!({
                            "session_id": session_id,
                            "speaker": speaker,
                            "cycles_left": cycles_left,
                            "turn_index": index,
                        }));
                    match self.events.append(event, self.config.turn_dedupe_window_sec) {
                        Ok(record) => {
                            debug!(tenant = %tenant, event_id = %record.event_id, speaker = %speaker, "turn event queued");
                        }
                        Err(e) => {
                            warn!(tenant = %tenant, speaker = %speaker, error = %e, "failed to queue turn event");
                        }
                    }
                    self.wake(tenant, &speaker);
                }
                Effect::RetireTurns { session_id, owner } => {
                    self.retire_turns(tenant, &session_id, owner.as_deref());
                }
                Effect::Wake(agent) => self.wake(tenant, &agent),
                Effect::Archive(resolution) => {
                    if let Err(e) = self.archive.archive(tenant, &resolution) {
                        warn!(
                            tenant = %tenant,
                            resolution_id = %resolution.resolution_id,
                            error = %e,
                            "failed to archive resolution"
                        );
                    }
                }
            }
        }
    }

    /// Turn events nobody picked before the floor moved on must not be
    /// picked later.
    fn retire_turns(&self, tenant: &str, session_id: &str, owner: Option<&str>) {
        let mut filter = EventFilter::default()
            .domain(self.config.turn_domain.clone())
            .event_type(TURN_EVENT_TYPE)
            .state(EventState::Queued)
            .payload_field("session_id", json!(session_id));
        if let Some(owner) = owner {
            filter = filter.owner(owner);
        }
        let stale = match self
            .events
            .list(tenant, &filter, self.events.config().max_list_limit)
        {
            Ok(stale) => stale,
            Err(e) => {
                warn!(tenant = %tenant, session_id = %session_id, error = %e, "failed to list stale turn events");
                return;
            }
        };
        for record in stale {
            match self.events.retire_queued(tenant, &record.event_id) {
                Ok(true) => {
                    debug!(tenant = %tenant, event_id = %record.event_id, owner = ?record.owner, "stale turn event retired");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(tenant = %tenant, event_id = %record.event_id, error = %e, "failed to retire turn event");
                }
            }
        }
    }

    fn wake(&self, tenant: &str, agent_id: &str) {
        if let Err(e) = self.notifier.wake(tenant, agent_id) {
            warn!(tenant = %tenant, agent = %agent_id, error = %e, "wake-up failed");
        }
    }
}
