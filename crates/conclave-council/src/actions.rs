use crate::types::{MeetingState, MotionState, Phase, VoteChoice, VoteRule};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A procedural action submitted by a participant (or the chair).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MotionAction {
    MotionSubmit {
        title: String,
        text: String,
        /// Overrides the rules profile's vote rule for this motion.
        #[serde(default)]
        vote_rule: Option<VoteRule>,
    },
    MotionSecond,
    DebateSpeak {
        text: String,
    },
    AmendSubmit {
        text: String,
    },
    AmendSecond,
    ProceduralCallQuestion,
    ProceduralTableMotion,
    VoteCast {
        choice: VoteChoice,
    },
    ReconsiderSubmit {
        target_motion_id: String,
        #[serde(default)]
        text: String,
    },
    ReconsiderSecond,
}

impl MotionAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            MotionAction::MotionSubmit { .. } => ActionKind::MotionSubmit,
            MotionAction::MotionSecond => ActionKind::MotionSecond,
            MotionAction::DebateSpeak { .. } => ActionKind::DebateSpeak,
            MotionAction::AmendSubmit { .. } => ActionKind::AmendSubmit,
            MotionAction::AmendSecond => ActionKind::AmendSecond,
            MotionAction::ProceduralCallQuestion => ActionKind::ProceduralCallQuestion,
            MotionAction::ProceduralTableMotion => ActionKind::ProceduralTableMotion,
            MotionAction::VoteCast { .. } => ActionKind::VoteCast,
            MotionAction::ReconsiderSubmit { .. } => ActionKind::ReconsiderSubmit,
            MotionAction::ReconsiderSecond => ActionKind::ReconsiderSecond,
        }
    }
}

/// Name of a [`MotionAction`], without its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    MotionSubmit,
    MotionSecond,
    DebateSpeak,
    AmendSubmit,
    AmendSecond,
    ProceduralCallQuestion,
    ProceduralTableMotion,
    VoteCast,
    ReconsiderSubmit,
    ReconsiderSecond,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::MotionSubmit => "motion_submit",
            ActionKind::MotionSecond => "motion_second",
            ActionKind::DebateSpeak => "debate_speak",
            ActionKind::AmendSubmit => "amend_submit",
            ActionKind::AmendSecond => "amend_second",
            ActionKind::ProceduralCallQuestion => "procedural_call_question",
            ActionKind::ProceduralTableMotion => "procedural_table_motion",
            ActionKind::VoteCast => "vote_cast",
            ActionKind::ReconsiderSubmit => "reconsider_submit",
            ActionKind::ReconsiderSecond => "reconsider_second",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Privileged chair override, independent of turn order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChairAction {
    Pause,
    Resume,
    Terminate {
        #[serde(default)]
        reason: Option<String>,
    },
    SkipTurn,
    RemoveParticipant {
        agent_id: String,
    },
}

impl ChairAction {
    pub fn name(&self) -> &'static str {
        match self {
            ChairAction::Pause => "pause",
            ChairAction::Resume => "resume",
            ChairAction::Terminate { .. } => "terminate",
            ChairAction::SkipTurn => "skip_turn",
            ChairAction::RemoveParticipant { .. } => "remove_participant",
        }
    }
}

/// What `actor` may do right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionWindow {
    pub session_id: Option<String>,
    pub phase: Option<Phase>,
    pub actor: String,
    pub is_participant: bool,
    pub is_chair: bool,
    pub is_speaker: bool,
    pub current_speaker: Option<String>,
    pub motion_id: Option<String>,
    pub motion_state: Option<MotionState>,
    pub allowed_actions: Vec<ActionKind>,
    pub chair_actions: Vec<String>,
}

/// Motion actions open to `actor` for the session's phase and floor.
///
/// Outside `in_session` nothing is allowed. Speaker-only actions (debate,
/// amending, calling the question) require the floor; seconding requires
/// someone other than the proposer; only participants vote.
pub fn allowed_actions(state: &MeetingState, actor: &str, is_chair: bool) -> Vec<ActionKind> {
    use ActionKind::*;

    let participant = state.is_participant(actor);
    if !state.is_live() || state.phase != Phase::InSession || !(participant || is_chair) {
        return Vec::new();
    }
    let speaker = state.is_speaker(actor);

    let Some(motion) = &state.current_motion else {
        let mut open = vec![MotionSubmit];
        let decided = state
            .motion_history
            .iter()
            .any(|m| matches!(m.outcome, MotionState::Adopted | MotionState::Rejected));
        if decided {
            open.push(ReconsiderSubmit);
        }
        return open;
    };

    let mut allowed = Vec::new();
    match motion.state {
        MotionState::Proposed => {
            if motion.proposer != actor {
                allowed.push(if motion.is_reconsideration() {
                    ReconsiderSecond
                } else {
                    MotionSecond
                });
            }
            allowed.push(ProceduralTableMotion);
        }
        MotionState::Seconded => {
            if speaker {
                allowed.extend([AmendSubmit, ProceduralCallQuestion]);
            }
            allowed.push(ProceduralTableMotion);
        }
        MotionState::Debating => {
            if speaker {
                allowed.extend([DebateSpeak, AmendSubmit, ProceduralCallQuestion]);
            }
            allowed.push(ProceduralTableMotion);
        }
        MotionState::AmendmentPending => {
            if speaker {
                allowed.extend([DebateSpeak, ProceduralCallQuestion]);
            }
            let amendment_proposer = motion.pending_amendment.as_ref().map(|a| a.proposer.as_str());
            if amendment_proposer != Some(actor) {
                allowed.push(AmendSecond);
            }
            allowed.push(ProceduralTableMotion);
        }
        MotionState::Voting => {
            if participant {
                allowed.push(VoteCast);
            }
        }
        MotionState::Adopted | MotionState::Rejected | MotionState::Tabled => {}
    }
    allowed
}

/// Chair overrides that would succeed in the session's current phase.
pub fn allowed_chair_actions(state: &MeetingState) -> Vec<String> {
    if !state.is_live() {
        return Vec::new();
    }
    let mut actions: Vec<&str> = Vec::new();
    match state.phase {
        Phase::InSession => actions.extend(["pause", "skip_turn"]),
        Phase::Paused => actions.push("resume"),
        _ => {}
    }
    actions.extend(["terminate", "remove_participant"]);
    actions.into_iter().map(String::from).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{FloorState, RulesProfile};
    use chrono::Utc;
    use serde_json::json;

    fn session(phase: Phase) -> MeetingState {
        let now = Utc::now();
        MeetingState {
            enabled: !phase.is_terminal(),
            session_id: "sess_1".into(),
            rules_profile: RulesProfile::Standard,
            phase,
            title: "Plan".into(),
            content: String::new(),
            agenda: Vec::new(),
            participants: vec!["a".into(), "b".into()],
            confirmed_agents: vec!["a".into(), "b".into()],
            cycles_total: 1,
            cycles_left: 1,
            current_index: 0,
            current_speaker: Some("a".into()),
            current_motion: None,
            floor_state: FloorState::Open,
            vote_state: None,
            deferred_event_ids: Vec::new(),
            resolution_ids: Vec::new(),
            motion_history: Vec::new(),
            initiator: "chair".into(),
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            ended_at: None,
        }
    }

    #[test]
    fn test_chair_actions_follow_phase() {
        assert_eq!(
            allowed_chair_actions(&session(Phase::InSession)),
            ["pause", "skip_turn", "terminate", "remove_participant"]
        );
        assert_eq!(
            allowed_chair_actions(&session(Phase::Paused)),
            ["resume", "terminate", "remove_participant"]
        );
        assert_eq!(
            allowed_chair_actions(&session(Phase::Collecting)),
            ["terminate", "remove_participant"]
        );
        assert!(allowed_chair_actions(&session(Phase::Completed)).is_empty());
        assert!(allowed_chair_actions(&session(Phase::Aborted)).is_empty());
    }

    #[test]
    fn test_speaker_only_actions_need_the_floor() {
        let state = session(Phase::InSession);
        assert_eq!(allowed_actions(&state, "a", false), [ActionKind::MotionSubmit]);
        assert_eq!(allowed_actions(&state, "b", false), [ActionKind::MotionSubmit]);
        assert!(allowed_actions(&state, "outsider", false).is_empty());
        assert!(allowed_actions(&session(Phase::Paused), "a", false).is_empty());
    }

    #[test]
    fn test_motion_action_wire_format() {
        let action: MotionAction =
            serde_json::from_value(json!({"action": "vote_cast", "choice": "yes"})).unwrap();
        assert_eq!(
            action,
            MotionAction::VoteCast {
                choice: VoteChoice::Yes
            }
        );
        assert_eq!(action.kind().as_str(), "vote_cast");

        let submit: MotionAction = serde_json::from_value(
            json!({"action": "motion_submit", "title": "Adopt RFC", "text": "- do it"}),
        )
        .unwrap();
        assert_eq!(submit.kind(), ActionKind::MotionSubmit);
    }

    #[test]
    fn test_chair_action_wire_format() {
        let action: ChairAction = serde_json::from_value(json!({"action": "terminate"})).unwrap();
        assert_eq!(action, ChairAction::Terminate { reason: None });
        assert_eq!(action.name(), "terminate");
    }
}
