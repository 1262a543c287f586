use chrono::{DateTime, Duration, Utc};
use conclave_core::{ConclaveError, ConclaveResult, JsonMap};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Payload keys owned by the queue itself. Producers must keep business state
/// out of them so transport state and business state never mix.
pub const RESERVED_PAYLOAD_KEYS: &[&str] = &[
    "state",
    "status",
    "business_state",
    "attempt",
    "max_attempts",
    "available_at",
    "picked_at",
    "done_at",
    "error_code",
    "error_message",
];

/// Error code stamped on work recovered by `reconcile_stale`.
pub const PROCESSING_TIMEOUT: &str = "PROCESSING_TIMEOUT";

/// Longest delay, window or timeout honoured, in seconds (about a century).
/// Larger values behave as this bound.
pub const MAX_SPAN_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// `at` shifted by `secs` seconds, with `secs` clamped to `±MAX_SPAN_SECS`.
pub(crate) fn offset_secs(at: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    let span = Duration::seconds(secs.clamp(-MAX_SPAN_SECS, MAX_SPAN_SECS));
    at.checked_add_signed(span).unwrap_or(at)
}

/// Lifecycle state of a queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    Queued,
    Picked,
    Processing,
    Done,
    Failed,
    Dead,
}

impl EventState {
    /// Every state, in lifecycle order.
    pub const ALL: [EventState; 6] = [
        EventState::Queued,
        EventState::Picked,
        EventState::Processing,
        EventState::Done,
        EventState::Failed,
        EventState::Dead,
    ];

    /// Adjacency list of the state machine.
    pub fn allowed_targets(self) -> &'static [EventState] {
        use EventState::*;
        match self {
            Queued => &[Picked, Processing, Done, Failed, Dead],
            Picked => &[Processing, Queued, Failed, Dead],
            Processing => &[Done, Queued, Failed, Dead],
            Done => &[],
            Failed => &[Queued],
            Dead => &[Queued],
        }
    }

    pub fn can_transition_to(self, target: EventState) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Queued or in flight.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            EventState::Queued | EventState::Picked | EventState::Processing
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EventState::Done | EventState::Dead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventState::Queued => "queued",
            EventState::Picked => "picked",
            EventState::Processing => "processing",
            EventState::Done => "done",
            EventState::Failed => "failed",
            EventState::Dead => "dead",
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventState {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConclaveError::Validation(format!("unknown event state '{s}'")))
    }
}

/// Error details recorded on a record when work fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// A unit of work in a tenant's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    /// Tenant the record belongs to.
    pub project_id: String,
    pub domain: String,
    pub event_type: String,
    pub state: EventState,
    /// Higher is more urgent.
    pub priority: i64,
    /// Agent the work belongs to, if any.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub payload: JsonMap,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
    /// The record is invisible to pickers before this instant.
    pub available_at: DateTime<Utc>,
    #[serde(default)]
    pub picked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub done_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub meta: JsonMap,
}

impl EventRecord {
    pub(crate) fn record_error(&mut self, error: &ErrorInfo) {
        self.error_code = Some(error.code.clone());
        self.error_message = Some(error.message.clone());
    }

    pub(crate) fn clear_error(&mut self) {
        self.error_code = None;
        self.error_message = None;
    }

    /// Count a failed attempt and either put the record back on the queue
    /// after `retry_delay_sec` or dead-letter it once attempts run out.
    pub(crate) fn requeue_or_bury(
        &mut self,
        error: &ErrorInfo,
        retry_delay_sec: i64,
        now: DateTime<Utc>,
    ) -> EventState {
        self.attempt += 1;
        self.record_error(error);
        if self.attempt >= self.max_attempts {
            self.state = EventState::Dead;
            self.done_at = Some(now);
        } else {
            self.state = EventState::Queued;
            self.available_at = offset_secs(now, retry_delay_sec.max(0));
            self.picked_at = None;
        }
        self.state
    }
}

/// Producer-side description of a new record.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub project_id: String,
    pub domain: String,
    pub event_type: String,
    pub priority: i64,
    pub owner: Option<String>,
    pub payload: serde_json::Value,
    pub meta: JsonMap,
    pub dedupe_key: Option<String>,
    pub max_attempts: Option<u32>,
    pub delay_sec: i64,
}

impl NewEvent {
    pub fn new(
        project_id: impl Into<String>,
        domain: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            domain: domain.into(),
            event_type: event_type.into(),
            priority: 0,
            owner: None,
            payload: serde_json::Value::Object(JsonMap::new()),
            meta: JsonMap::new(),
            dedupe_key: None,
            max_attempts: None,
            delay_sec: 0,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Attach the payload. It must be a JSON object (or `null` for none).
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Hide the record from pickers for `secs` seconds after creation.
    pub fn with_delay_secs(mut self, secs: i64) -> Self {
        self.delay_sec = secs;
        self
    }

    /// Check the transport invariants and extract the payload map.
    pub(crate) fn validated_payload(&self) -> ConclaveResult<JsonMap> {
        if self.domain.trim().is_empty() || self.event_type.trim().is_empty() {
            return Err(ConclaveError::Validation(
                "domain and event_type are required".into(),
            ));
        }
        let payload = match &self.payload {
            serde_json::Value::Null => JsonMap::new(),
            serde_json::Value::Object(map) => map.clone(),
            other => {
                return Err(ConclaveError::Validation(format!(
                    "payload must be a JSON object, got {other}"
                )))
            }
        };
        if let Some(key) = payload
            .keys()
            .find(|key| RESERVED_PAYLOAD_KEYS.contains(&key.as_str()))
        {
            return Err(ConclaveError::ReservedPayloadKey(key.clone()));
        }
        Ok(payload)
    }

    pub(crate) fn into_record(
        self,
        payload: JsonMap,
        default_max_attempts: u32,
        now: DateTime<Utc>,
    ) -> EventRecord {
        EventRecord {
            event_id: format!("evt_{}", Uuid::new_v4().simple()),
            project_id: self.project_id,
            domain: self.domain,
            event_type: self.event_type,
            state: EventState::Queued,
            priority: self.priority,
            owner: self.owner,
            payload,
            attempt: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts).max(1),
            dedupe_key: self.dedupe_key.filter(|k| !k.is_empty()),
            created_at: now,
            available_at: offset_secs(now, self.delay_sec.max(0)),
            picked_at: None,
            done_at: None,
            error_code: None,
            error_message: None,
            meta: self.meta,
        }
    }
}

/// Filters for [`crate::EventStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub domain: Option<String>,
    pub event_type: Option<String>,
    pub state: Option<EventState>,
    pub owner: Option<String>,
    /// Top-level payload field that must equal the given value.
    pub payload_field: Option<(String, serde_json::Value)>,
}

impl EventFilter {
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn state(mut self, state: EventState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn payload_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload_field = Some((key.into(), value));
        self
    }

    pub(crate) fn matches_payload(&self, record: &EventRecord) -> bool {
        match &self.payload_field {
            Some((key, value)) => record.payload.get(key) == Some(value),
            None => true,
        }
    }
}

/// Parameters of a pick.
///
/// While `now < cooldown_until` only event types in `preempt_types` may be
/// picked; everything else waits for the cooldown to lapse.
#[derive(Debug, Clone)]
pub struct PickRequest {
    pub domain: String,
    pub preempt_types: Vec<String>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    pub owner: Option<String>,
}

impl PickRequest {
    pub fn new(domain: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            domain: domain.into(),
            preempt_types: Vec::new(),
            cooldown_until: None,
            now,
            owner: None,
        }
    }

    pub fn with_cooldown(mut self, until: DateTime<Utc>, preempt_types: Vec<String>) -> Self {
        self.cooldown_until = Some(until);
        self.preempt_types = preempt_types;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// True when the cooldown lane keeps `event_type` from being picked now.
    pub fn held_by_cooldown(&self, event_type: &str) -> bool {
        let cooling = matches!(self.cooldown_until, Some(until) if self.now < until);
        cooling && !self.preempt_types.iter().any(|t| t == event_type)
    }
}

/// Outcome of a stale-work sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records put back on the queue.
    pub requeued: Vec<String>,
    /// Records that ran out of attempts.
    pub dead: Vec<String>,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.requeued.len() + self.dead.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transition_table() {
        use EventState::*;
        assert!(Queued.can_transition_to(Picked));
        assert!(Picked.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Done));
        assert!(Failed.can_transition_to(Queued));
        assert!(!Done.can_transition_to(Queued));
        assert!(!Picked.can_transition_to(Done));
        assert!(Done.allowed_targets().is_empty());
    }

    #[test]
    fn test_state_parse_and_display() {
        for state in EventState::ALL {
            assert_eq!(state.as_str().parse::<EventState>().unwrap(), state);
        }
        assert!("zombie".parse::<EventState>().is_err());
        assert_eq!(
            serde_json::to_string(&EventState::Processing).unwrap(),
            "\"processing\""
        );
    }

    #[test]
    fn test_reserved_payload_key_rejected() {
        let event = NewEvent::new("t", "sched", "manual").with_payload(json!({"status": "x"}));
        let err = event.validated_payload().unwrap_err();
        assert!(matches!(err, ConclaveError::ReservedPayloadKey(ref k) if k == "status"));
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let event = NewEvent::new("t", "sched", "manual").with_payload(json!([1, 2]));
        assert!(event.validated_payload().is_err());
        let event = NewEvent::new("t", "sched", "manual").with_payload(serde_json::Value::Null);
        assert!(event.validated_payload().unwrap().is_empty());
    }

    #[test]
    fn test_cooldown_lane() {
        let now = Utc::now();
        let req = PickRequest::new("sched", now)
            .with_cooldown(now + Duration::seconds(30), vec!["urgent".into()]);
        assert!(req.held_by_cooldown("manual"));
        assert!(!req.held_by_cooldown("urgent"));

        let lapsed = PickRequest::new("sched", now).with_cooldown(now, vec![]);
        assert!(!lapsed.held_by_cooldown("manual"));
    }

    #[test]
    fn test_requeue_or_bury() {
        let now = Utc::now();
        let mut record = NewEvent::new("t", "sched", "manual")
            .with_max_attempts(2)
            .into_record(JsonMap::new(), 3, now);
        let err = ErrorInfo::new("E", "boom");

        assert_eq!(record.requeue_or_bury(&err, 10, now), EventState::Queued);
        assert_eq!(record.available_at, now + Duration::seconds(10));
        assert_eq!(record.requeue_or_bury(&err, 10, now), EventState::Dead);
        assert_eq!(record.done_at, Some(now));
        assert_eq!(record.error_code.as_deref(), Some("E"));
    }

    #[test]
    fn test_huge_delays_saturate() {
        let now = Utc::now();
        let far = now + Duration::seconds(MAX_SPAN_SECS);

        let mut record = NewEvent::new("t", "sched", "manual")
            .with_delay_secs(i64::MAX)
            .into_record(JsonMap::new(), 3, now);
        assert_eq!(record.available_at, far);

        let err = ErrorInfo::new("E", "boom");
        assert_eq!(record.requeue_or_bury(&err, i64::MAX, now), EventState::Queued);
        assert_eq!(record.available_at, far);

        assert_eq!(offset_secs(now, i64::MIN), now - Duration::seconds(MAX_SPAN_SECS));
    }
}
