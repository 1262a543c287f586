use crate::hooks::EnqueueHook;
use crate::types::{
    offset_secs, ErrorInfo, EventFilter, EventRecord, EventState, NewEvent, PickRequest,
    ReconcileReport, PROCESSING_TIMEOUT,
};
use chrono::{DateTime, Utc};
use conclave_core::{
    Clock, ConclaveConfig, ConclaveError, ConclaveResult, QueueConfig, SystemClock,
    TenantDatabases,
};
use parking_lot::RwLock;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    event_id     TEXT PRIMARY KEY,
    domain       TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    state        TEXT NOT NULL,
    priority     INTEGER NOT NULL,
    owner        TEXT,
    dedupe_key   TEXT,
    created_us   INTEGER NOT NULL,
    available_us INTEGER NOT NULL,
    body         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_pick
    ON events (state, domain, priority DESC, created_us);
CREATE INDEX IF NOT EXISTS idx_events_dedupe
    ON events (event_type, dedupe_key);
";

const ORDER_BY: &str = "ORDER BY priority DESC, created_us ASC, rowid ASC";

/// Durable per-tenant priority work queue.
///
/// Each tenant lives in its own SQLite file. Every operation runs in one
/// transaction under the tenant's write lock and re-reads what it needs, so
/// concurrent pickers in one tenant are linearized and tenants never contend.
pub struct EventStore {
    dbs: TenantDatabases,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    hooks: RwLock<Vec<Arc<dyn EnqueueHook>>>,
}

impl EventStore {
    /// Open a store rooted at `dir` with default settings and the system clock.
    pub fn open(dir: impl Into<PathBuf>) -> ConclaveResult<Self> {
        Self::with_settings(dir, QueueConfig::default(), 5_000, Arc::new(SystemClock))
    }

    pub fn with_settings(
        dir: impl Into<PathBuf>,
        config: QueueConfig,
        busy_timeout_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> ConclaveResult<Self> {
        Ok(Self {
            dbs: TenantDatabases::open(dir, SCHEMA, busy_timeout_ms)?,
            config,
            clock,
            hooks: RwLock::new(Vec::new()),
        })
    }

    /// Build a store from the `[storage]` and `[queue]` sections.
    pub fn from_config(config: &ConclaveConfig, clock: Arc<dyn Clock>) -> ConclaveResult<Self> {
        Self::with_settings(
            config.storage.events_dir(),
            config.queue.clone(),
            config.storage.busy_timeout_ms,
            clock,
        )
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Register a hook run after every newly appended record.
    pub fn add_hook(&self, hook: Arc<dyn EnqueueHook>) {
        self.hooks.write().push(hook);
    }

    /// Append a record, or return the live duplicate if one was created with
    /// the same type and dedupe key inside the window.
    pub fn append(&self, event: NewEvent, dedupe_window_sec: i64) -> ConclaveResult<EventRecord> {
        let payload = event.validated_payload()?;
        let tenant = event.project_id.clone();
        let now = self.clock.now();
        let default_max_attempts = self.config.default_max_attempts;

        let (record, created) = self.dbs.write(&tenant, |conn| {
            if let Some(key) = event.dedupe_key.as_deref().filter(|k| !k.is_empty()) {
                if dedupe_window_sec > 0 {
                    let since = offset_secs(now, -dedupe_window_sec);
                    if let Some(existing) =
                        find_live_duplicate(conn, &event.event_type, key, since)?
                    {
                        return Ok((existing, false));
                    }
                }
            }
            let record = event.into_record(payload, default_max_attempts, now);
            save(conn, &record)?;
            Ok((record, true))
        })?;

        if created {
            info!(
                tenant = %tenant,
                event_id = %record.event_id,
                event_type = %record.event_type,
                priority = record.priority,
                "event appended"
            );
            self.run_hooks(&record);
        } else {
            debug!(tenant = %tenant, event_id = %record.event_id, "dedupe hit, returning live record");
        }
        Ok(record)
    }

    /// Append with the configured default dedupe window.
    pub fn append_default(&self, event: NewEvent) -> ConclaveResult<EventRecord> {
        self.append(event, self.config.default_dedupe_window_sec)
    }

    fn run_hooks(&self, record: &EventRecord) {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            if let Err(e) = hook.on_enqueued(record) {
                warn!(event_id = %record.event_id, error = %e, "enqueue hook failed");
            }
        }
    }

    pub fn get(&self, tenant: &str, event_id: &str) -> ConclaveResult<Option<EventRecord>> {
        self.dbs.read(tenant, |conn| load(conn, event_id))
    }

    /// Records matching `filter`, most urgent first. `limit` is clamped to
    /// `1..=max_list_limit`.
    pub fn list(
        &self,
        tenant: &str,
        filter: &EventFilter,
        limit: usize,
    ) -> ConclaveResult<Vec<EventRecord>> {
        let limit = limit.clamp(1, self.config.max_list_limit.max(1));
        let mut clauses = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(domain) = &filter.domain {
            clauses.push("domain = ?");
            values.push(SqlValue::Text(domain.clone()));
        }
        if let Some(event_type) = &filter.event_type {
            clauses.push("event_type = ?");
            values.push(SqlValue::Text(event_type.clone()));
        }
        if let Some(state) = filter.state {
            clauses.push("state = ?");
            values.push(SqlValue::Text(state.as_str().to_string()));
        }
        if let Some(owner) = &filter.owner {
            clauses.push("owner = ?");
            values.push(SqlValue::Text(owner.clone()));
        }
        let mut sql = String::from("SELECT event_id, body FROM events");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push(' ');
        sql.push_str(ORDER_BY);
        if filter.payload_field.is_none() {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        self.dbs.read(tenant, |conn| {
            let records = query(conn, &sql, values)?;
            Ok(records
                .into_iter()
                .filter(|r| filter.matches_payload(r))
                .take(limit)
                .collect())
        })
    }

    /// Pick the most urgent eligible record and mark it PICKED.
    pub fn pick_next(&self, tenant: &str, request: &PickRequest) -> ConclaveResult<Option<EventRecord>> {
        let picked = self.dbs.write(tenant, |conn| {
            for mut record in pick_candidates(conn, request)? {
                if request.held_by_cooldown(&record.event_type) {
                    continue;
                }
                record.state = EventState::Picked;
                record.picked_at = Some(request.now);
                save(conn, &record)?;
                return Ok(Some(record));
            }
            Ok(None)
        })?;
        if let Some(record) = &picked {
            info!(tenant = %tenant, event_id = %record.event_id, event_type = %record.event_type, "event picked");
        }
        Ok(picked)
    }

    /// The records `pick_next` would consider, in the order it would try
    /// them, without picking any of them.
    pub fn eligible_candidates(
        &self,
        tenant: &str,
        request: &PickRequest,
    ) -> ConclaveResult<Vec<EventRecord>> {
        self.dbs.read(tenant, |conn| {
            Ok(pick_candidates(conn, request)?
                .into_iter()
                .filter(|r| !request.held_by_cooldown(&r.event_type))
                .collect())
        })
    }

    /// Mark one specific record PICKED if it is still QUEUED and available.
    /// Returns `None` when another picker got there first.
    pub fn claim(
        &self,
        tenant: &str,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> ConclaveResult<Option<EventRecord>> {
        self.dbs.write(tenant, |conn| {
            let Some(mut record) = load(conn, event_id)? else {
                return Ok(None);
            };
            if record.state != EventState::Queued || record.available_at > now {
                return Ok(None);
            }
            record.state = EventState::Picked;
            record.picked_at = Some(now);
            save(conn, &record)?;
            Ok(Some(record))
        })
    }

    /// Mark a record DONE only if it is still QUEUED. Returns false when it
    /// was picked (or finished) in the meantime.
    pub fn retire_queued(&self, tenant: &str, event_id: &str) -> ConclaveResult<bool> {
        let now = self.clock.now();
        self.dbs.write(tenant, |conn| {
            let Some(mut record) = load(conn, event_id)? else {
                return Ok(false);
            };
            if record.state != EventState::Queued {
                return Ok(false);
            }
            record.state = EventState::Done;
            record.done_at = Some(now);
            save(conn, &record)?;
            Ok(true)
        })
    }

    /// Move a record to `target`, enforcing the transition table. Moving into
    /// DONE is always permitted; DEAD only re-enters QUEUED via [`Self::retry_event`].
    pub fn transition_state(
        &self,
        tenant: &str,
        event_id: &str,
        target: EventState,
        error: Option<ErrorInfo>,
    ) -> ConclaveResult<EventRecord> {
        let now = self.clock.now();
        self.dbs.write(tenant, |conn| {
            let mut record = require(conn, event_id)?;
            let from = record.state;
            if from == EventState::Done && target == EventState::Done {
                return Ok(record);
            }
            let allowed = target == EventState::Done
                || (from.can_transition_to(target)
                    && !(from == EventState::Dead && target == EventState::Queued));
            if !allowed {
                return Err(ConclaveError::InvalidTransition {
                    from: from.to_string(),
                    to: target.to_string(),
                });
            }

            match target {
                EventState::Picked => record.picked_at = Some(now),
                EventState::Processing => {
                    record.picked_at.get_or_insert(now);
                }
                EventState::Queued => {
                    record.available_at = now;
                    record.picked_at = None;
                    record.done_at = None;
                }
                EventState::Done | EventState::Failed | EventState::Dead => {
                    record.done_at = Some(now);
                }
            }
            record.state = target;
            if let Some(error) = &error {
                record.record_error(error);
            }
            save(conn, &record)?;
            debug!(tenant = %tenant, event_id = %event_id, from = %from, to = %target, "event transitioned");
            Ok(record)
        })
    }

    /// Count a failed attempt: requeue after `retry_delay_sec`, or dead-letter
    /// once `max_attempts` is reached. Returns the resulting state.
    pub fn requeue_or_dead(
        &self,
        tenant: &str,
        event_id: &str,
        error_code: &str,
        error_message: &str,
        retry_delay_sec: i64,
    ) -> ConclaveResult<EventState> {
        let now = self.clock.now();
        let error = ErrorInfo::new(error_code, error_message);
        let record = self.dbs.write(tenant, |conn| {
            let mut record = require(conn, event_id)?;
            if !record.state.is_active() {
                return Err(ConclaveError::InvalidTransition {
                    from: record.state.to_string(),
                    to: EventState::Queued.to_string(),
                });
            }
            record.requeue_or_bury(&error, retry_delay_sec, now);
            save(conn, &record)?;
            Ok(record)
        })?;
        if record.state == EventState::Dead {
            info!(
                tenant = %tenant,
                event_id = %event_id,
                attempt = record.attempt,
                error_code = %error_code,
                "event dead-lettered"
            );
        }
        Ok(record.state)
    }

    /// Operator recovery: DEAD or FAILED back to QUEUED, available immediately,
    /// error fields cleared. The attempt count is kept, so a retried dead
    /// record gets exactly one more attempt.
    pub fn retry_event(&self, tenant: &str, event_id: &str) -> ConclaveResult<EventRecord> {
        let now = self.clock.now();
        self.dbs.write(tenant, |conn| {
            let mut record = require(conn, event_id)?;
            if !matches!(record.state, EventState::Dead | EventState::Failed) {
                return Err(ConclaveError::InvalidTransition {
                    from: record.state.to_string(),
                    to: EventState::Queued.to_string(),
                });
            }
            record.state = EventState::Queued;
            record.available_at = now;
            record.picked_at = None;
            record.done_at = None;
            record.clear_error();
            save(conn, &record)?;
            info!(tenant = %tenant, event_id = %event_id, "event retried");
            Ok(record)
        })
    }

    /// Recover PICKED/PROCESSING records older than `timeout_sec` (measured
    /// from `picked_at`, falling back to `created_at`), applying the same
    /// attempt accounting as [`Self::requeue_or_dead`].
    pub fn reconcile_stale(
        &self,
        tenant: &str,
        domain: Option<&str>,
        timeout_sec: i64,
    ) -> ConclaveResult<ReconcileReport> {
        let now = self.clock.now();
        let cutoff = offset_secs(now, -timeout_sec.max(0));
        let retry_delay = self.config.stale_retry_delay_sec;
        let error = ErrorInfo::new(
            PROCESSING_TIMEOUT,
            format!("no progress within {timeout_sec}s"),
        );

        let report = self.dbs.write(tenant, |conn| {
            let mut values = vec![
                SqlValue::Text(EventState::Picked.as_str().to_string()),
                SqlValue::Text(EventState::Processing.as_str().to_string()),
            ];
            let mut sql = String::from("SELECT event_id, body FROM events WHERE state IN (?, ?)");
            if let Some(domain) = domain {
                sql.push_str(" AND domain = ?");
                values.push(SqlValue::Text(domain.to_string()));
            }

            let mut report = ReconcileReport::default();
            for mut record in query(conn, &sql, values)? {
                let since = record.picked_at.unwrap_or(record.created_at);
                if since >= cutoff {
                    continue;
                }
                match record.requeue_or_bury(&error, retry_delay, now) {
                    EventState::Dead => report.dead.push(record.event_id.clone()),
                    _ => report.requeued.push(record.event_id.clone()),
                }
                save(conn, &record)?;
            }
            Ok(report)
        })?;

        if report.total() > 0 {
            warn!(
                tenant = %tenant,
                requeued = report.requeued.len(),
                dead = report.dead.len(),
                "recovered stale work"
            );
        }
        Ok(report)
    }

    /// Number of records per state.
    pub fn counts(&self, tenant: &str) -> ConclaveResult<BTreeMap<EventState, usize>> {
        self.dbs.read(tenant, |conn| {
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM events GROUP BY state")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut counts = BTreeMap::new();
            for row in rows {
                let (state, count) = row?;
                match state.parse::<EventState>() {
                    Ok(state) => {
                        counts.insert(state, count as usize);
                    }
                    Err(_) => warn!(tenant = %tenant, state = %state, "unknown state in store"),
                }
            }
            Ok(counts)
        })
    }
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn decode(event_id: &str, body: &str) -> Option<EventRecord> {
    match serde_json::from_str(body) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(event_id = %event_id, error = %e, "skipping corrupt event row");
            None
        }
    }
}

fn save(conn: &Connection, record: &EventRecord) -> ConclaveResult<()> {
    let body = serde_json::to_string(record)?;
    conn.execute(
        "INSERT INTO events
            (event_id, domain, event_type, state, priority, owner, dedupe_key,
             created_us, available_us, body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(event_id) DO UPDATE SET
            state = excluded.state,
            priority = excluded.priority,
            owner = excluded.owner,
            available_us = excluded.available_us,
            body = excluded.body",
        params![
            record.event_id,
            record.domain,
            record.event_type,
            record.state.as_str(),
            record.priority,
            record.owner,
            record.dedupe_key,
            micros(record.created_at),
            micros(record.available_at),
            body,
        ],
    )?;
    Ok(())
}

fn load(conn: &Connection, event_id: &str) -> ConclaveResult<Option<EventRecord>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM events WHERE event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(body.and_then(|body| decode(event_id, &body)))
}

fn require(conn: &Connection, event_id: &str) -> ConclaveResult<EventRecord> {
    load(conn, event_id)?.ok_or_else(|| ConclaveError::NotFound(format!("event {event_id}")))
}

fn query(conn: &Connection, sql: &str, values: Vec<SqlValue>) -> ConclaveResult<Vec<EventRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(values), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut records = Vec::new();
    for row in rows {
        let (event_id, body) = row?;
        if let Some(record) = decode(&event_id, &body) {
            records.push(record);
        }
    }
    Ok(records)
}

fn pick_candidates(conn: &Connection, request: &PickRequest) -> ConclaveResult<Vec<EventRecord>> {
    let mut values = vec![
        SqlValue::Text(EventState::Queued.as_str().to_string()),
        SqlValue::Text(request.domain.clone()),
        SqlValue::Integer(micros(request.now)),
    ];
    let mut sql = String::from(
        "SELECT event_id, body FROM events WHERE state = ? AND domain = ? AND available_us <= ?",
    );
    if let Some(owner) = &request.owner {
        sql.push_str(" AND owner = ?");
        values.push(SqlValue::Text(owner.clone()));
    }
    sql.push(' ');
    sql.push_str(ORDER_BY);
    query(conn, &sql, values)
}

fn find_live_duplicate(
    conn: &Connection,
    event_type: &str,
    dedupe_key: &str,
    since: DateTime<Utc>,
) -> ConclaveResult<Option<EventRecord>> {
    let sql = "SELECT event_id, body FROM events
               WHERE event_type = ? AND dedupe_key = ?
                 AND state IN ('queued', 'picked', 'processing')
                 AND created_us >= ?
               ORDER BY created_us DESC LIMIT 1";
    let values = vec![
        SqlValue::Text(event_type.to_string()),
        SqlValue::Text(dedupe_key.to_string()),
        SqlValue::Integer(micros(since)),
    ];
    Ok(query(conn, sql, values)?.into_iter().next())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conclave_core::ManualClock;
    use serde_json::json;

    fn store_with_clock() -> (tempfile::TempDir, EventStore, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store = EventStore::with_settings(
            dir.path(),
            QueueConfig::default(),
            1_000,
            clock.clone(),
        )
        .unwrap();
        (dir, store, clock)
    }

    #[test]
    fn test_corrupt_row_is_skipped() {
        let (_dir, store, clock) = store_with_clock();
        let good = store
            .append(NewEvent::new("acme", "sched", "manual"), 0)
            .unwrap();
        store
            .dbs
            .write("acme", |conn| {
                conn.execute(
                    "INSERT INTO events (event_id, domain, event_type, state, priority,
                        created_us, available_us, body)
                     VALUES ('evt_bad', 'sched', 'manual', 'queued', 99, 0, 0, '{not json')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let listed = store.list("acme", &EventFilter::default(), 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].event_id, good.event_id);

        let picked = store
            .pick_next("acme", &PickRequest::new("sched", clock.now()))
            .unwrap()
            .unwrap();
        assert_eq!(picked.event_id, good.event_id);
    }

    #[test]
    fn test_list_payload_filter_and_clamp() {
        let (_dir, store, _clock) = store_with_clock();
        for region in ["eu", "us", "eu"] {
            store
                .append(
                    NewEvent::new("acme", "sched", "report").with_payload(json!({"region": region})),
                    0,
                )
                .unwrap();
        }
        let eu = store
            .list(
                "acme",
                &EventFilter::default().payload_field("region", json!("eu")),
                100,
            )
            .unwrap();
        assert_eq!(eu.len(), 2);

        let one = store.list("acme", &EventFilter::default(), 0).unwrap();
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn test_counts_by_state() {
        let (_dir, store, clock) = store_with_clock();
        store.append(NewEvent::new("acme", "sched", "a"), 0).unwrap();
        store.append(NewEvent::new("acme", "sched", "b"), 0).unwrap();
        store
            .pick_next("acme", &PickRequest::new("sched", clock.now()))
            .unwrap();
        let counts = store.counts("acme").unwrap();
        assert_eq!(counts.get(&EventState::Queued), Some(&1));
        assert_eq!(counts.get(&EventState::Picked), Some(&1));
    }
}
