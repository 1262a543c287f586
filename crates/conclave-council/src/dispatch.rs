use crate::engine::CouncilEngine;
use crate::types::{GateReason, TURN_EVENT_TYPE};
use conclave_core::ConclaveResult;
use conclave_queue::{EventRecord, EventStore, PickRequest};
use tracing::{debug, info};

/// Pick the next record `agent_id` may work on.
///
/// Walks the store's eligible candidates in pick order, asks the council
/// gate about each and claims the first one it allows. Vetoed candidates
/// stay QUEUED (and are recorded as deferred); a candidate lost to a
/// concurrent picker is skipped. Turn events addressed to other agents are
/// never considered, whatever the request's owner filter.
pub fn pick_for_agent(
    store: &EventStore,
    council: &CouncilEngine,
    tenant: &str,
    agent_id: &str,
    request: &PickRequest,
) -> ConclaveResult<Option<EventRecord>> {
    let mut vetoed = 0usize;
    for candidate in store.eligible_candidates(tenant, request)? {
        if candidate.event_type == TURN_EVENT_TYPE && candidate.owner.as_deref() != Some(agent_id) {
            continue;
        }
        let gate = council.evaluate_pick_gate(tenant, agent_id, &candidate)?;
        if !gate.allowed {
            vetoed += 1;
            continue;
        }
        if let Some(record) = store.claim(tenant, &candidate.event_id, request.now)? {
            info!(
                tenant = %tenant,
                agent = %agent_id,
                event_id = %record.event_id,
                event_type = %record.event_type,
                turn = gate.reason == GateReason::OwnTurn,
                "event dispatched"
            );
            return Ok(Some(record));
        }
        debug!(tenant = %tenant, event_id = %candidate.event_id, "candidate claimed elsewhere");
    }
    if vetoed > 0 {
        debug!(tenant = %tenant, agent = %agent_id, vetoed, "no pickable event");
    }
    Ok(None)
}
