//! Session procedure: turn rotation, the motion state machine, ballots and
//! resolution drafting. Everything here mutates an in-memory `MeetingState`
//! inside the tenant's write transaction; side effects that leave the
//! council database are queued as [`Effect`]s and run after commit.

use crate::actions::{allowed_actions, MotionAction};
use crate::collaborators::RunState;
use crate::persistence;
use crate::types::{
    Amendment, ContractStub, DebateEntry, ExecutionTask, MeetingState, Motion, MotionRecord,
    MotionState, Phase, Resolution, Tally, VoteChoice, VoteRule, RECONSIDER_PREFIX,
};
use chrono::{DateTime, Utc};
use conclave_core::{ConclaveError, ConclaveResult};
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

/// Work deferred until the council transaction has committed.
#[derive(Debug, Clone)]
pub(crate) enum Effect {
    /// Synthesize a turn event for `speaker` and wake them.
    Turn {
        session_id: String,
        speaker: String,
        cycles_left: u32,
        index: usize,
    },
    /// Mark still-queued turn events of the session DONE; all of them when
    /// `owner` is `None`.
    RetireTurns {
        session_id: String,
        owner: Option<String>,
    },
    Wake(String),
    Archive(Resolution),
}

/// Context of one council call.
pub(crate) struct Step<'a> {
    pub conn: &'a Connection,
    pub now: DateTime<Utc>,
    pub effects: Vec<Effect>,
    pub target_motion_id: Option<String>,
    /// The call changed the session and must be saved and audited.
    pub changed: bool,
}

impl<'a> Step<'a> {
    pub fn new(conn: &'a Connection, now: DateTime<Utc>) -> Self {
        Self {
            conn,
            now,
            effects: Vec::new(),
            target_motion_id: None,
            changed: true,
        }
    }
}

/// A ballot that closed.
#[derive(Debug, Clone)]
pub(crate) struct Decision {
    pub outcome: MotionState,
    pub tally: Tally,
    pub resolution: Option<Resolution>,
}

fn invalid(msg: impl Into<String>) -> ConclaveError {
    ConclaveError::Validation(msg.into())
}

pub(crate) fn announce_turn(state: &MeetingState, step: &mut Step<'_>) {
    if let Some(speaker) = &state.current_speaker {
        step.effects.push(Effect::Turn {
            session_id: state.session_id.clone(),
            speaker: speaker.clone(),
            cycles_left: state.cycles_left,
            index: state.current_index,
        });
    }
}

/// Leave `draining` if no participant is mid-execution. Returns whether the
/// session started.
pub(crate) fn try_begin(
    state: &mut MeetingState,
    step: &mut Step<'_>,
    run_states: &HashMap<String, RunState>,
) -> bool {
    let busy: Vec<&str> = state
        .participants
        .iter()
        .filter(|p| run_states.get(*p).is_some_and(|s| s.is_executing()))
        .map(String::as_str)
        .collect();
    if !busy.is_empty() {
        debug!(session_id = %state.session_id, busy = ?busy, "still draining");
        return false;
    }
    state.phase = Phase::InSession;
    state.current_index = 0;
    state.cycles_left = state.cycles_total;
    state.current_speaker = state.participants.first().cloned();
    state.started_at = Some(step.now);
    info!(
        session_id = %state.session_id,
        speaker = ?state.current_speaker,
        cycles = state.cycles_total,
        "council session in progress"
    );
    announce_turn(state, step);
    true
}

/// Pass the floor to the next participant. Wrapping around the ring uses up
/// one cycle; the last cycle ends the session.
pub(crate) fn advance_turn(state: &mut MeetingState, step: &mut Step<'_>) -> ConclaveResult<()> {
    if let Some(previous) = &state.current_speaker {
        step.effects.push(Effect::RetireTurns {
            session_id: state.session_id.clone(),
            owner: Some(previous.clone()),
        });
    }
    if state.participants.is_empty() {
        return finish(state, step, Phase::Completed);
    }
    state.current_index += 1;
    if state.current_index >= state.participants.len() {
        state.current_index = 0;
        state.cycles_left = state.cycles_left.saturating_sub(1);
        if state.cycles_left == 0 {
            return finish(state, step, Phase::Completed);
        }
    }
    state.current_speaker = state.participants.get(state.current_index).cloned();
    debug!(
        session_id = %state.session_id,
        speaker = ?state.current_speaker,
        cycles_left = state.cycles_left,
        "turn advanced"
    );
    announce_turn(state, step);
    Ok(())
}

/// Move to a terminal phase: table any live motion, release every deferral
/// and wake the participants.
pub(crate) fn finish(
    state: &mut MeetingState,
    step: &mut Step<'_>,
    phase: Phase,
) -> ConclaveResult<()> {
    if let Some(motion) = state.current_motion.take() {
        state
            .motion_history
            .push(history_entry(&motion, MotionState::Tabled, None, None, step.now));
    }
    state.phase = phase;
    state.enabled = false;
    state.current_speaker = None;
    state.ended_at = Some(step.now);
    let released = persistence::release_deferrals(step.conn, &state.session_id, step.now)?;
    state.deferred_event_ids.clear();
    step.effects.push(Effect::RetireTurns {
        session_id: state.session_id.clone(),
        owner: None,
    });
    for participant in &state.participants {
        step.effects.push(Effect::Wake(participant.clone()));
    }
    info!(
        session_id = %state.session_id,
        phase = %phase,
        released = released.len(),
        resolutions = state.resolution_ids.len(),
        "council session closed"
    );
    Ok(())
}

/// Drop `agent` from the ring, keeping the current speaker where possible.
pub(crate) fn remove_participant(
    state: &mut MeetingState,
    agent: &str,
    step: &mut Step<'_>,
) -> ConclaveResult<Option<Decision>> {
    let Some(pos) = state.participants.iter().position(|p| p == agent) else {
        return Err(invalid(format!(
            "{agent} is not a participant of session {}",
            state.session_id
        )));
    };
    state.participants.remove(pos);
    state.confirmed_agents.retain(|a| a != agent);
    if let Some(motion) = state.current_motion.as_mut() {
        motion.votes.remove(agent);
    }
    step.effects.push(Effect::RetireTurns {
        session_id: state.session_id.clone(),
        owner: Some(agent.to_string()),
    });
    step.effects.push(Effect::Wake(agent.to_string()));

    if state.participants.is_empty() {
        finish(state, step, Phase::Completed)?;
        return Ok(None);
    }

    let phase = state.phase;
    match phase {
        Phase::Collecting if state.all_confirmed() => state.phase = Phase::Draining,
        Phase::InSession | Phase::Paused => {
            if pos < state.current_index {
                state.current_index -= 1;
            } else if pos == state.current_index {
                if state.current_index >= state.participants.len() {
                    state.current_index = 0;
                    state.cycles_left = state.cycles_left.saturating_sub(1);
                    if state.cycles_left == 0 {
                        finish(state, step, Phase::Completed)?;
                        return Ok(None);
                    }
                }
                state.current_speaker = state.participants.get(state.current_index).cloned();
                if phase == Phase::InSession {
                    announce_turn(state, step);
                }
            }
        }
        _ => {}
    }
    maybe_decide(state, step)
}

fn live_motion(state: &mut MeetingState) -> ConclaveResult<&mut Motion> {
    state
        .current_motion
        .as_mut()
        .ok_or_else(|| invalid("no motion on the floor"))
}

fn non_empty(field: &str, value: &str) -> ConclaveResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(invalid(format!("{field} must not be empty")));
    }
    Ok(value.to_string())
}

/// Apply one motion action. The caller has already resolved whether `actor`
/// holds chair privileges.
pub(crate) fn apply_motion_action(
    state: &mut MeetingState,
    actor: &str,
    is_chair: bool,
    action: MotionAction,
    debate_cap: usize,
    step: &mut Step<'_>,
) -> ConclaveResult<Option<Decision>> {
    let kind = action.kind();
    let allowed = allowed_actions(state, actor, is_chair);
    if !allowed.contains(&kind) {
        let names: Vec<&str> = allowed.iter().map(|k| k.as_str()).collect();
        return Err(invalid(format!(
            "{kind} is not allowed for {actor} in phase {} (allowed: [{}])",
            state.phase,
            names.join(", ")
        )));
    }
    let now = step.now;

    match action {
        MotionAction::MotionSubmit {
            title,
            text,
            vote_rule,
        } => {
            let title = non_empty("title", &title)?;
            if title.starts_with(RECONSIDER_PREFIX) {
                return Err(invalid(format!(
                    "titles starting with '{RECONSIDER_PREFIX}' are reserved for reconsideration"
                )));
            }
            let motion = new_motion(
                title,
                text,
                actor,
                vote_rule.unwrap_or_else(|| state.rules_profile.vote_rule()),
                None,
                now,
            );
            step.target_motion_id = Some(motion.motion_id.clone());
            info!(session_id = %state.session_id, motion_id = %motion.motion_id, proposer = %actor, "motion submitted");
            state.current_motion = Some(motion);
        }
        MotionAction::ReconsiderSubmit {
            target_motion_id,
            text,
        } => {
            let Some(original) = state.motion_history.iter().find(|m| {
                m.motion_id == target_motion_id
                    && matches!(m.outcome, MotionState::Adopted | MotionState::Rejected)
            }) else {
                return Err(invalid(format!(
                    "motion {target_motion_id} was not decided in session {}",
                    state.session_id
                )));
            };
            let title = format!("{RECONSIDER_PREFIX} {}", original.title);
            let text = if text.trim().is_empty() {
                original.title.clone()
            } else {
                text
            };
            let motion = new_motion(
                title,
                text,
                actor,
                state.rules_profile.vote_rule(),
                Some(target_motion_id),
                now,
            );
            step.target_motion_id = Some(motion.motion_id.clone());
            info!(session_id = %state.session_id, motion_id = %motion.motion_id, "reconsideration submitted");
            state.current_motion = Some(motion);
        }
        MotionAction::MotionSecond | MotionAction::ReconsiderSecond => {
            let debate = state.rules_profile.debate_enabled();
            let motion = live_motion(state)?;
            motion.seconded_by = Some(actor.to_string());
            motion.state = if debate {
                MotionState::Debating
            } else {
                MotionState::Seconded
            };
            motion.updated_at = now;
        }
        MotionAction::DebateSpeak { text } => {
            let text = non_empty("text", &text)?;
            let motion = live_motion(state)?;
            if motion.pending_amendment.take().is_some() {
                debug!(motion_id = %motion.motion_id, "pending amendment lapsed");
            }
            motion.debate.push(DebateEntry {
                actor: actor.to_string(),
                text,
                at: now,
            });
            if motion.debate.len() > debate_cap {
                let overflow = motion.debate.len() - debate_cap;
                motion.debate.drain(..overflow);
            }
            motion.state = MotionState::Debating;
            motion.updated_at = now;
        }
        MotionAction::AmendSubmit { text } => {
            let text = non_empty("text", &text)?;
            let motion = live_motion(state)?;
            motion.pending_amendment = Some(Amendment {
                text,
                proposer: actor.to_string(),
                submitted_at: now,
            });
            motion.state = MotionState::AmendmentPending;
            motion.updated_at = now;
        }
        MotionAction::AmendSecond => {
            let motion = live_motion(state)?;
            let amendment = motion
                .pending_amendment
                .take()
                .ok_or_else(|| invalid("no amendment pending"))?;
            motion.text = if motion.text.is_empty() {
                amendment.text
            } else {
                format!("{}\n{}", motion.text, amendment.text)
            };
            motion.state = MotionState::Debating;
            motion.updated_at = now;
        }
        MotionAction::ProceduralCallQuestion => {
            let motion = live_motion(state)?;
            motion.pending_amendment = None;
            motion.votes = BTreeMap::new();
            motion.state = MotionState::Voting;
            motion.updated_at = now;
            info!(motion_id = %motion.motion_id, "question called, ballot open");
        }
        MotionAction::ProceduralTableMotion => {
            let motion = state
                .current_motion
                .take()
                .ok_or_else(|| invalid("no motion on the floor"))?;
            info!(motion_id = %motion.motion_id, "motion tabled");
            state
                .motion_history
                .push(history_entry(&motion, MotionState::Tabled, None, None, now));
        }
        MotionAction::VoteCast { choice } => {
            let motion = live_motion(state)?;
            motion.votes.insert(actor.to_string(), choice);
            motion.updated_at = now;
            return maybe_decide(state, step);
        }
    }
    Ok(None)
}

fn new_motion(
    title: String,
    text: String,
    proposer: &str,
    vote_rule: VoteRule,
    reconsiders: Option<String>,
    now: DateTime<Utc>,
) -> Motion {
    Motion {
        motion_id: format!("mot_{}", Uuid::new_v4().simple()),
        title,
        text: text.trim().to_string(),
        state: MotionState::Proposed,
        proposer: proposer.to_string(),
        seconded_by: None,
        vote_rule,
        reconsiders,
        debate: Vec::new(),
        pending_amendment: None,
        votes: BTreeMap::new(),
        created_at: now,
        updated_at: now,
    }
}

fn history_entry(
    motion: &Motion,
    outcome: MotionState,
    tally: Option<Tally>,
    resolution_id: Option<String>,
    now: DateTime<Utc>,
) -> MotionRecord {
    MotionRecord {
        motion_id: motion.motion_id.clone(),
        title: motion.title.clone(),
        proposer: motion.proposer.clone(),
        outcome,
        tally,
        resolution_id,
        decided_at: now,
    }
}

/// Close the ballot once every participant has voted.
pub(crate) fn maybe_decide(
    state: &mut MeetingState,
    step: &mut Step<'_>,
) -> ConclaveResult<Option<Decision>> {
    let tally = match state.current_motion.as_ref() {
        Some(motion) if motion.state == MotionState::Voting => {
            let ballots: Vec<&VoteChoice> = motion
                .votes
                .iter()
                .filter(|(voter, _)| state.is_participant(voter))
                .map(|(_, choice)| choice)
                .collect();
            if state.participants.is_empty() || ballots.len() < state.participants.len() {
                return Ok(None);
            }
            Tally::count(ballots, motion.vote_rule)
        }
        _ => return Ok(None),
    };
    let Some(motion) = state.current_motion.take() else {
        return Ok(None);
    };

    let (outcome, resolution) = if tally.adopted() {
        let resolution = draft_resolution(state, &motion, tally, step.now);
        persistence::insert_resolution(step.conn, &resolution)?;
        state.resolution_ids.push(resolution.resolution_id.clone());
        step.effects.push(Effect::Archive(resolution.clone()));
        (MotionState::Adopted, Some(resolution))
    } else {
        (MotionState::Rejected, None)
    };
    state.motion_history.push(history_entry(
        &motion,
        outcome,
        Some(tally),
        resolution.as_ref().map(|r| r.resolution_id.clone()),
        step.now,
    ));
    info!(
        session_id = %state.session_id,
        motion_id = %motion.motion_id,
        decision = %outcome,
        yes = tally.yes,
        no = tally.no,
        abstain = tally.abstain,
        "ballot closed"
    );
    Ok(Some(Decision {
        outcome,
        tally,
        resolution,
    }))
}

/// Task title from a bullet (`-`, `*`, `•`) or numbered (`1.`, `2)`) line.
fn task_line(line: &str) -> Option<&str> {
    let line = line.trim();
    for bullet in ["- ", "* ", "• "] {
        if let Some(rest) = line.strip_prefix(bullet) {
            return Some(rest.trim()).filter(|s| !s.is_empty());
        }
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    rest.strip_prefix('.')
        .or_else(|| rest.strip_prefix(')'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub(crate) fn draft_resolution(
    state: &MeetingState,
    motion: &Motion,
    tally: Tally,
    now: DateTime<Utc>,
) -> Resolution {
    let resolution_id = format!("res_{}", Uuid::new_v4().simple());
    let mut titles: Vec<String> = motion
        .text
        .lines()
        .filter_map(task_line)
        .map(String::from)
        .collect();
    if titles.is_empty() {
        titles.push(motion.title.clone());
    }
    let execution_tasks = titles
        .into_iter()
        .enumerate()
        .map(|(i, title)| ExecutionTask {
            task_id: format!("{resolution_id}-task-{}", i + 1),
            title,
            owner: motion.proposer.clone(),
            status: "open".to_string(),
        })
        .collect();
    Resolution {
        resolution_id,
        session_id: state.session_id.clone(),
        motion_id: motion.motion_id.clone(),
        title: motion.title.clone(),
        decision: MotionState::Adopted.as_str().to_string(),
        tally,
        obligations: motion.text.clone(),
        execution_tasks,
        contract: ContractStub {
            contract_id: format!("ctr_{}", Uuid::new_v4().simple()),
            parties: state.participants.clone(),
            terms: motion.text.clone(),
            status: "draft".to_string(),
        },
        created_at: now,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_lines() {
        assert_eq!(task_line("- ship it"), Some("ship it"));
        assert_eq!(task_line("  * review"), Some("review"));
        assert_eq!(task_line("2) publish"), Some("publish"));
        assert_eq!(task_line("10. archive"), Some("archive"));
        assert_eq!(task_line("plain prose"), None);
        assert_eq!(task_line("2024 was a year"), None);
        assert_eq!(task_line("- "), None);
    }
}
