//! SQLite layout of a tenant's council database: the latest session
//! snapshot, the audit ledger, adopted resolutions and the deferral side table.

use crate::types::{Deferral, LedgerResult, LedgerRow, MeetingState, Phase, Resolution};
use chrono::{DateTime, TimeZone, Utc};
use conclave_core::{ConclaveError, ConclaveResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meeting (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    updated_us INTEGER NOT NULL,
    body       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ledger (
    seq              INTEGER PRIMARY KEY,
    ts_us            INTEGER NOT NULL,
    actor_id         TEXT NOT NULL,
    phase            TEXT,
    action_type      TEXT NOT NULL,
    target_motion_id TEXT,
    payload          TEXT NOT NULL,
    result           TEXT NOT NULL,
    error            TEXT
);
CREATE TABLE IF NOT EXISTS resolutions (
    resolution_id TEXT PRIMARY KEY,
    session_id    TEXT NOT NULL,
    motion_id     TEXT NOT NULL,
    created_us    INTEGER NOT NULL,
    body          TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS deferrals (
    event_id    TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL,
    agent_id    TEXT NOT NULL,
    deferred    INTEGER NOT NULL,
    deferred_us INTEGER NOT NULL,
    released_us INTEGER
);
CREATE INDEX IF NOT EXISTS idx_deferrals_session ON deferrals (session_id, deferred);
";

fn from_micros(us: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(us).single().unwrap_or_default()
}

/// The stored session, if any. An unreadable snapshot is logged and treated
/// as absent, so the next `start_session` overwrites it.
pub(crate) fn load_state(conn: &Connection) -> ConclaveResult<Option<MeetingState>> {
    let body: Option<String> = conn
        .query_row("SELECT body FROM meeting WHERE id = 1", [], |row| row.get(0))
        .optional()?;
    let Some(body) = body else {
        return Ok(None);
    };
    match serde_json::from_str(&body) {
        Ok(state) => Ok(Some(state)),
        Err(e) => {
            warn!(error = %e, "ignoring corrupt session snapshot");
            Ok(None)
        }
    }
}

pub(crate) fn save_state(conn: &Connection, state: &MeetingState) -> ConclaveResult<()> {
    let body = serde_json::to_string(state)?;
    conn.execute(
        "INSERT INTO meeting (id, updated_us, body) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET updated_us = excluded.updated_us, body = excluded.body",
        params![state.updated_at.timestamp_micros(), body],
    )?;
    Ok(())
}

/// Fields of a ledger row before it is numbered.
pub(crate) struct LedgerEntry<'a> {
    pub ts: DateTime<Utc>,
    pub actor_id: &'a str,
    pub phase: Option<Phase>,
    pub action_type: &'a str,
    pub target_motion_id: Option<&'a str>,
    pub payload: &'a serde_json::Value,
    pub error: Option<String>,
}

/// Append a ledger row numbered one past the current maximum. Must run
/// inside the tenant's write transaction so numbering stays gap-free.
pub(crate) fn append_ledger(conn: &Connection, entry: LedgerEntry<'_>) -> ConclaveResult<u64> {
    let seq: i64 = conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM ledger", [], |row| {
        row.get(0)
    })?;
    let result = if entry.error.is_some() {
        LedgerResult::Error
    } else {
        LedgerResult::Ok
    };
    conn.execute(
        "INSERT INTO ledger
            (seq, ts_us, actor_id, phase, action_type, target_motion_id, payload, result, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            seq,
            entry.ts.timestamp_micros(),
            entry.actor_id,
            entry.phase.map(Phase::as_str),
            entry.action_type,
            entry.target_motion_id,
            serde_json::to_string(entry.payload)?,
            match result {
                LedgerResult::Ok => "ok",
                LedgerResult::Error => "error",
            },
            entry.error,
        ],
    )?;
    Ok(seq as u64)
}

fn ledger_row(row: &Row<'_>) -> rusqlite::Result<(i64, i64, String, Option<String>, String, Option<String>, String, String, Option<String>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

pub(crate) fn list_ledger(conn: &Connection, since_seq: u64, limit: usize) -> ConclaveResult<Vec<LedgerRow>> {
    let mut stmt = conn.prepare(
        "SELECT seq, ts_us, actor_id, phase, action_type, target_motion_id, payload, result, error
         FROM ledger WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![since_seq as i64, limit as i64], ledger_row)?;
    let mut out = Vec::new();
    for row in rows {
        let (seq, ts_us, actor_id, phase, action_type, target_motion_id, payload, result, error) =
            row?;
        let payload = serde_json::from_str(&payload).unwrap_or_else(|e| {
            warn!(seq, error = %e, "unreadable ledger payload");
            serde_json::Value::Null
        });
        out.push(LedgerRow {
            seq: seq as u64,
            ts: from_micros(ts_us),
            actor_id,
            phase: phase.and_then(|p| serde_json::from_value(serde_json::Value::String(p)).ok()),
            action_type,
            target_motion_id,
            payload,
            result: if result == "ok" {
                LedgerResult::Ok
            } else {
                LedgerResult::Error
            },
            error,
        });
    }
    Ok(out)
}

pub(crate) fn insert_resolution(conn: &Connection, resolution: &Resolution) -> ConclaveResult<()> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO resolutions (resolution_id, session_id, motion_id, created_us, body)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            resolution.resolution_id,
            resolution.session_id,
            resolution.motion_id,
            resolution.created_at.timestamp_micros(),
            serde_json::to_string(resolution)?,
        ],
    )?;
    if inserted == 0 {
        return Err(ConclaveError::Validation(format!(
            "resolution {} already written",
            resolution.resolution_id
        )));
    }
    Ok(())
}

pub(crate) fn list_resolutions(
    conn: &Connection,
    session_id: Option<&str>,
    limit: usize,
) -> ConclaveResult<Vec<Resolution>> {
    let mut stmt = conn.prepare(
        "SELECT resolution_id, body FROM resolutions
         WHERE (?1 IS NULL OR session_id = ?1)
         ORDER BY created_us ASC, rowid ASC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![session_id, limit as i64], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, body) = row?;
        match serde_json::from_str(&body) {
            Ok(resolution) => out.push(resolution),
            Err(e) => warn!(resolution_id = %id, error = %e, "skipping corrupt resolution row"),
        }
    }
    Ok(out)
}

/// Record a deferral. Returns false if the event is already deferred in this session.
pub(crate) fn defer_event(
    conn: &Connection,
    event_id: &str,
    session_id: &str,
    agent_id: &str,
    now: DateTime<Utc>,
) -> ConclaveResult<bool> {
    let already: Option<i64> = conn
        .query_row(
            "SELECT deferred FROM deferrals WHERE event_id = ?1 AND session_id = ?2",
            params![event_id, session_id],
            |row| row.get(0),
        )
        .optional()?;
    if already == Some(1) {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO deferrals (event_id, session_id, agent_id, deferred, deferred_us, released_us)
         VALUES (?1, ?2, ?3, 1, ?4, NULL)
         ON CONFLICT(event_id) DO UPDATE SET
            session_id = excluded.session_id,
            agent_id = excluded.agent_id,
            deferred = 1,
            deferred_us = excluded.deferred_us,
            released_us = NULL",
        params![event_id, session_id, agent_id, now.timestamp_micros()],
    )?;
    Ok(true)
}

/// Clear every deferral of a session. Returns the released event ids.
pub(crate) fn release_deferrals(
    conn: &Connection,
    session_id: &str,
    now: DateTime<Utc>,
) -> ConclaveResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT event_id FROM deferrals WHERE session_id = ?1 AND deferred = 1")?;
    let ids = stmt
        .query_map(params![session_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    conn.execute(
        "UPDATE deferrals SET deferred = 0, released_us = ?2 WHERE session_id = ?1 AND deferred = 1",
        params![session_id, now.timestamp_micros()],
    )?;
    Ok(ids)
}

pub(crate) fn list_deferrals(conn: &Connection) -> ConclaveResult<Vec<Deferral>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, session_id, agent_id, deferred, deferred_us, released_us
         FROM deferrals ORDER BY deferred_us ASC, rowid ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(Deferral {
            event_id: row.get(0)?,
            session_id: row.get(1)?,
            agent_id: row.get(2)?,
            deferred: row.get::<_, i64>(3)? == 1,
            deferred_at: from_micros(row.get(4)?),
            released_at: row.get::<_, Option<i64>>(5)?.map(from_micros),
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub(crate) fn is_deferred(conn: &Connection, event_id: &str) -> ConclaveResult<bool> {
    let flag: Option<i64> = conn
        .query_row(
            "SELECT deferred FROM deferrals WHERE event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(flag == Some(1))
}
