#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for the EventStore: state machine, ordering, dedupe,
//! retry accounting and stale recovery.

use chrono::Duration;
use conclave_core::{Clock, ConclaveError, ConclaveResult, ManualClock, QueueConfig};
use conclave_queue::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const T: &str = "acme";

fn setup() -> (tempfile::TempDir, EventStore, Arc<ManualClock>) {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::default());
    let store =
        EventStore::with_settings(dir.path(), QueueConfig::default(), 1_000, clock.clone()).unwrap();
    (dir, store, clock)
}

fn manual(priority: i64) -> NewEvent {
    NewEvent::new(T, "sched", "manual").with_priority(priority)
}

/// Drive a fresh record into `state` through allowed edges.
fn record_in(store: &EventStore, state: EventState) -> String {
    let id = store.append(manual(10), 0).unwrap().event_id;
    let path: &[EventState] = match state {
        EventState::Queued => &[],
        EventState::Picked => &[EventState::Picked],
        EventState::Processing => &[EventState::Processing],
        EventState::Done => &[EventState::Done],
        EventState::Failed => &[EventState::Failed],
        EventState::Dead => &[EventState::Dead],
    };
    for step in path {
        store.transition_state(T, &id, *step, None).unwrap();
    }
    id
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[test]
fn test_every_table_edge_succeeds_once() {
    let (_dir, store, _clock) = setup();
    for from in EventState::ALL {
        for to in from.allowed_targets() {
            if from == EventState::Dead && *to == EventState::Queued {
                continue;
            }
            let id = record_in(&store, from);
            let moved = store.transition_state(T, &id, *to, None).unwrap();
            assert_eq!(moved.state, *to, "{from} -> {to}");
        }
    }
}

#[test]
fn test_disallowed_edges_are_rejected() {
    let (_dir, store, _clock) = setup();
    let cases = [
        (EventState::Done, EventState::Queued),
        (EventState::Done, EventState::Picked),
        (EventState::Picked, EventState::Picked),
        (EventState::Failed, EventState::Processing),
        (EventState::Dead, EventState::Picked),
        (EventState::Dead, EventState::Queued),
    ];
    for (from, to) in cases {
        let id = record_in(&store, from);
        let err = store.transition_state(T, &id, to, None).unwrap_err();
        assert!(
            matches!(err, ConclaveError::InvalidTransition { .. }),
            "{from} -> {to} should fail, got {err}"
        );
    }
}

#[test]
fn test_done_is_always_reachable() {
    let (_dir, store, _clock) = setup();
    for from in [EventState::Failed, EventState::Dead, EventState::Picked] {
        let id = record_in(&store, from);
        let done = store.transition_state(T, &id, EventState::Done, None).unwrap();
        assert_eq!(done.state, EventState::Done);
        assert!(done.done_at.is_some());
    }
}

#[test]
fn test_transition_matches_table_for_every_pair() {
    let (_dir, store, _clock) = setup();
    for from in EventState::ALL {
        for to in EventState::ALL {
            let id = record_in(&store, from);
            let expected = to == EventState::Done
                || (from.can_transition_to(to)
                    && !(from == EventState::Dead && to == EventState::Queued));
            match store.transition_state(T, &id, to, None) {
                Ok(record) => {
                    assert!(expected, "{from} -> {to} should have been rejected");
                    assert_eq!(record.state, to);
                }
                Err(err) => {
                    assert!(!expected, "{from} -> {to} should succeed, got {err}");
                    assert!(matches!(err, ConclaveError::InvalidTransition { .. }));
                    assert_eq!(store.get(T, &id).unwrap().unwrap().state, from);
                }
            }
        }
    }
}

#[test]
fn test_retire_queued_only_touches_queued_records() {
    let (_dir, store, _clock) = setup();
    let queued = record_in(&store, EventState::Queued);
    assert!(store.retire_queued(T, &queued).unwrap());
    let retired = store.get(T, &queued).unwrap().unwrap();
    assert_eq!(retired.state, EventState::Done);
    assert!(retired.done_at.is_some());

    let picked = record_in(&store, EventState::Picked);
    assert!(!store.retire_queued(T, &picked).unwrap());
    assert_eq!(
        store.get(T, &picked).unwrap().unwrap().state,
        EventState::Picked
    );
    assert!(!store.retire_queued(T, "evt_missing").unwrap());
}

#[test]
fn test_failed_transition_records_error() {
    let (_dir, store, _clock) = setup();
    let id = record_in(&store, EventState::Processing);
    let failed = store
        .transition_state(
            T,
            &id,
            EventState::Failed,
            Some(ErrorInfo::new("UPSTREAM", "503 from provider")),
        )
        .unwrap();
    assert_eq!(failed.error_code.as_deref(), Some("UPSTREAM"));
    assert!(failed.done_at.is_some());
}

// ---------------------------------------------------------------------------
// Picking
// ---------------------------------------------------------------------------

#[test]
fn test_pick_orders_by_priority_then_age() {
    let (_dir, store, clock) = setup();
    let low = store.append(manual(10), 0).unwrap();
    clock.advance_secs(1);
    let high_old = store.append(manual(50), 0).unwrap();
    clock.advance_secs(1);
    let high_new = store.append(manual(50), 0).unwrap();

    let req = PickRequest::new("sched", clock.now());
    let order: Vec<String> = (0..3)
        .map(|_| store.pick_next(T, &req).unwrap().unwrap().event_id)
        .collect();
    assert_eq!(order, vec![high_old.event_id, high_new.event_id, low.event_id]);
    assert!(store.pick_next(T, &req).unwrap().is_none());
}

#[test]
fn test_pick_never_returns_future_work() {
    let (_dir, store, clock) = setup();
    let delayed = store.append(manual(99).with_delay_secs(60), 0).unwrap();
    let now_req = PickRequest::new("sched", clock.now());
    assert!(store.pick_next(T, &now_req).unwrap().is_none());

    clock.advance_secs(61);
    let later = PickRequest::new("sched", clock.now());
    let picked = store.pick_next(T, &later).unwrap().unwrap();
    assert_eq!(picked.event_id, delayed.event_id);
    assert_eq!(picked.picked_at, Some(clock.now()));
}

#[test]
fn test_pick_respects_domain_and_owner() {
    let (_dir, store, clock) = setup();
    store
        .append(NewEvent::new(T, "other", "manual").with_priority(99), 0)
        .unwrap();
    let bob = store.append(manual(5).with_owner("bob"), 0).unwrap();
    store.append(manual(50).with_owner("alice"), 0).unwrap();

    let req = PickRequest::new("sched", clock.now()).with_owner("bob");
    assert_eq!(store.pick_next(T, &req).unwrap().unwrap().event_id, bob.event_id);
}

#[test]
fn test_cooldown_lets_only_preempt_types_through() {
    let (_dir, store, clock) = setup();
    store.append(manual(90), 0).unwrap();
    let urgent = store
        .append(NewEvent::new(T, "sched", "urgent").with_priority(10), 0)
        .unwrap();

    let until = clock.now() + Duration::seconds(30);
    let req = PickRequest::new("sched", clock.now()).with_cooldown(until, vec!["urgent".into()]);
    let picked = store.pick_next(T, &req).unwrap().unwrap();
    assert_eq!(picked.event_id, urgent.event_id);
    assert!(store.pick_next(T, &req).unwrap().is_none());

    let after = PickRequest::new("sched", until).with_cooldown(until, vec!["urgent".into()]);
    assert_eq!(store.pick_next(T, &after).unwrap().unwrap().event_type, "manual");
}

#[test]
fn test_claim_is_compare_and_set() {
    let (_dir, store, clock) = setup();
    let rec = store.append(manual(1), 0).unwrap();
    let candidates = store
        .eligible_candidates(T, &PickRequest::new("sched", clock.now()))
        .unwrap();
    assert_eq!(candidates.len(), 1);

    assert!(store.claim(T, &rec.event_id, clock.now()).unwrap().is_some());
    assert!(store.claim(T, &rec.event_id, clock.now()).unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Append: dedupe, invariants, hooks
// ---------------------------------------------------------------------------

#[test]
fn test_dedupe_returns_live_record_within_window() {
    let (_dir, store, clock) = setup();
    let first = store.append(manual(10).with_dedupe_key("daily"), 300).unwrap();
    let again = store.append(manual(10).with_dedupe_key("daily"), 300).unwrap();
    assert_eq!(first.event_id, again.event_id);

    clock.advance_secs(301);
    let expired = store.append(manual(10).with_dedupe_key("daily"), 300).unwrap();
    assert_ne!(expired.event_id, first.event_id);
}

#[test]
fn test_dedupe_ignores_finished_records() {
    let (_dir, store, _clock) = setup();
    let first = store.append(manual(10).with_dedupe_key("k"), 300).unwrap();
    store
        .transition_state(T, &first.event_id, EventState::Done, None)
        .unwrap();
    let second = store.append(manual(10).with_dedupe_key("k"), 300).unwrap();
    assert_ne!(second.event_id, first.event_id);
}

#[test]
fn test_unbounded_windows_and_delays_saturate() {
    let (_dir, store, clock) = setup();
    let first = store.append(manual(10).with_dedupe_key("k"), 300).unwrap();
    let again = store
        .append(manual(10).with_dedupe_key("k"), i64::MAX)
        .unwrap();
    assert_eq!(again.event_id, first.event_id);

    let far = store.append(manual(1).with_delay_secs(i64::MAX), 0).unwrap();
    assert_eq!(
        far.available_at,
        clock.now() + Duration::seconds(MAX_SPAN_SECS)
    );

    store
        .transition_state(T, &first.event_id, EventState::Picked, None)
        .unwrap();
    let report = store.reconcile_stale(T, None, i64::MAX).unwrap();
    assert_eq!(report.total(), 0);

    let state = store
        .requeue_or_dead(T, &first.event_id, "E", "slow", i64::MAX)
        .unwrap();
    assert_eq!(state, EventState::Queued);
    let parked = store.get(T, &first.event_id).unwrap().unwrap();
    assert!(parked.available_at > clock.now());
}

#[test]
fn test_reserved_payload_key_is_rejected_before_write() {
    let (_dir, store, _clock) = setup();
    let err = store
        .append(manual(1).with_payload(json!({"attempt": 3})), 0)
        .unwrap_err();
    assert!(matches!(err, ConclaveError::ReservedPayloadKey(_)));
    assert!(store
        .list(T, &EventFilter::default(), 10)
        .unwrap()
        .is_empty());
}

#[test]
fn test_failing_hook_does_not_undo_append() {
    let (_dir, store, _clock) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    store.add_hook(Arc::new(move |_: &EventRecord| -> ConclaveResult<()> {
        seen.fetch_add(1, Ordering::SeqCst);
        Err(ConclaveError::Collaborator("notifier offline".into()))
    }));

    let rec = store.append(manual(1), 0).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(store.get(T, &rec.event_id).unwrap().is_some());
}

// ---------------------------------------------------------------------------
// Retry accounting
// ---------------------------------------------------------------------------

#[test]
fn test_requeue_until_dead() {
    let (_dir, store, clock) = setup();
    let rec = store.append(manual(1).with_max_attempts(3), 0).unwrap();

    for _ in 0..2 {
        let state = store
            .requeue_or_dead(T, &rec.event_id, "E", "transient", 30)
            .unwrap();
        assert_eq!(state, EventState::Queued);
    }
    let queued = store.get(T, &rec.event_id).unwrap().unwrap();
    assert!(queued.available_at > clock.now());
    assert_eq!(queued.attempt, 2);

    let state = store
        .requeue_or_dead(T, &rec.event_id, "E", "transient", 30)
        .unwrap();
    assert_eq!(state, EventState::Dead);
    let dead = store.get(T, &rec.event_id).unwrap().unwrap();
    assert!(dead.done_at.is_some());
    assert_eq!(dead.error_message.as_deref(), Some("transient"));
}

#[test]
fn test_retry_event_revives_dead_work() {
    let (_dir, store, clock) = setup();
    let rec = store.append(manual(1).with_max_attempts(1), 0).unwrap();
    store.requeue_or_dead(T, &rec.event_id, "E", "x", 0).unwrap();

    let revived = store.retry_event(T, &rec.event_id).unwrap();
    assert_eq!(revived.state, EventState::Queued);
    assert!(revived.error_code.is_none());
    assert_eq!(revived.available_at, clock.now());

    let err = store.retry_event(T, &rec.event_id).unwrap_err();
    assert!(matches!(err, ConclaveError::InvalidTransition { .. }));
}

#[test]
fn test_requeue_rejects_finished_records() {
    let (_dir, store, _clock) = setup();
    let id = record_in(&store, EventState::Done);
    assert!(store.requeue_or_dead(T, &id, "E", "x", 0).is_err());
    assert!(matches!(
        store.requeue_or_dead(T, "evt_missing", "E", "x", 0),
        Err(ConclaveError::NotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Stale recovery
// ---------------------------------------------------------------------------

#[test]
fn test_reconcile_recovers_stuck_work() {
    let (_dir, store, clock) = setup();
    let retryable = store.append(manual(1).with_max_attempts(3), 0).unwrap();
    let last_chance = store.append(manual(1).with_max_attempts(1), 0).unwrap();
    let fresh = store.append(manual(1), 0).unwrap();

    store
        .transition_state(T, &retryable.event_id, EventState::Picked, None)
        .unwrap();
    store
        .transition_state(T, &last_chance.event_id, EventState::Processing, None)
        .unwrap();
    clock.advance_secs(120);
    store
        .transition_state(T, &fresh.event_id, EventState::Picked, None)
        .unwrap();

    let report = store.reconcile_stale(T, Some("sched"), 60).unwrap();
    assert_eq!(report.requeued, vec![retryable.event_id.clone()]);
    assert_eq!(report.dead, vec![last_chance.event_id.clone()]);

    let requeued = store.get(T, &retryable.event_id).unwrap().unwrap();
    assert_eq!(requeued.state, EventState::Queued);
    assert_eq!(requeued.error_code.as_deref(), Some(PROCESSING_TIMEOUT));
    assert_eq!(
        store.get(T, &fresh.event_id).unwrap().unwrap().state,
        EventState::Picked
    );
}

// ---------------------------------------------------------------------------
// End to end and isolation
// ---------------------------------------------------------------------------

#[test]
fn test_manual_event_picked_then_dead() {
    let (_dir, store, clock) = setup();
    let rec = store
        .append(NewEvent::new(T, "sched", "manual").with_priority(80).with_max_attempts(1), 0)
        .unwrap();
    let picked = store
        .pick_next(T, &PickRequest::new("sched", clock.now()))
        .unwrap()
        .unwrap();
    assert_eq!(picked.event_id, rec.event_id);
    assert_eq!(picked.state, EventState::Picked);

    let state = store
        .requeue_or_dead(T, &rec.event_id, "E", "fatal", 10)
        .unwrap();
    assert_eq!(state, EventState::Dead);
    assert_eq!(state.to_string(), "dead");
}

#[test]
fn test_tenants_are_isolated() {
    let (_dir, store, clock) = setup();
    store
        .append(NewEvent::new("other", "sched", "manual").with_priority(99), 0)
        .unwrap();
    assert!(store
        .pick_next(T, &PickRequest::new("sched", clock.now()))
        .unwrap()
        .is_none());
}

#[test]
fn test_concurrent_pickers_never_share_a_record() {
    let (_dir, store, clock) = setup();
    for i in 0..40 {
        store.append(manual(i), 0).unwrap();
    }
    let store = Arc::new(store);
    let now = clock.now();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let req = PickRequest::new("sched", now);
                let mut mine = Vec::new();
                while let Some(rec) = store.pick_next(T, &req).unwrap() {
                    mine.push(rec.event_id);
                }
                mine
            })
        })
        .collect();

    let mut all: Vec<String> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(all.len(), 40);
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 40);
}
