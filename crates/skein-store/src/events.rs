use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use skein_core::ids::{EventId, RunId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A stored event row. Append-only: rows are never mutated or deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRow {
    pub id: EventId,
    pub run_id: RunId,
    pub session_id: SessionId,
    pub sequence: i64,
    pub event_type: String,
    pub timestamp: String,
    pub payload: serde_json::Value,
}

/// Per-run append lock for sequence linearization.
struct RunLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl RunLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn get(&mut self, run_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn remove(&mut self, run_id: &str) {
        self.locks.remove(run_id);
    }
}

pub struct EventRepo {
    db: Database,
    run_locks: Mutex<RunLocks>,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            run_locks: Mutex::new(RunLocks::new()),
        }
    }

    /// Append an event to a run's log. Atomically:
    /// 1. Acquires the per-run lock
    /// 2. Reads the current max sequence
    /// 3. Inserts the event at max + 1
    ///
    /// Sequences are gap-free and strictly increasing per run; the
    /// UNIQUE(run_id, sequence) constraint enforces this at the DB level.
    #[instrument(skip(self, payload), fields(run_id = %run_id, event_type))]
    pub fn append(
        &self,
        run_id: &RunId,
        session_id: &SessionId,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<EventRow, StoreError> {
        let lock = self.run_locks.lock().get(run_id.as_str());
        let _guard = lock.lock();

        self.db
            .with_conn(|conn| append_in_conn(conn, run_id, session_id, event_type, payload))
    }

    /// List events for a run, ordered by sequence.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn list(
        &self,
        run_id: &RunId,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<EventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let limit = limit.unwrap_or(1000);
            let offset = offset.unwrap_or(0);
            let mut stmt = conn.prepare(
                "SELECT id, run_id, session_id, sequence, type, timestamp, payload
                 FROM events WHERE run_id = ?1
                 ORDER BY sequence ASC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![run_id.as_str(), limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    /// Replay support: all events with sequence strictly greater than
    /// `after_sequence`, in order.
    #[instrument(skip(self), fields(run_id = %run_id, after_sequence))]
    pub fn list_after_sequence(
        &self,
        run_id: &RunId,
        after_sequence: i64,
        limit: u32,
    ) -> Result<Vec<EventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, session_id, sequence, type, timestamp, payload
                 FROM events WHERE run_id = ?1 AND sequence > ?2
                 ORDER BY sequence ASC
                 LIMIT ?3",
            )?;
            let mut rows =
                stmt.query(rusqlite::params![run_id.as_str(), after_sequence, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    /// Drop the append lock for a closed run. Appends after this still work;
    /// the lock is recreated on demand.
    pub fn forget_run(&self, run_id: &RunId) {
        self.run_locks.lock().remove(run_id.as_str());
    }

    /// Count events for a run.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn count(&self, run_id: &RunId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM events WHERE run_id = ?1",
                [run_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

/// Insert one event using an already-held connection. Used by `append` and
/// by the state repo's transactional save-with-events path; in both cases
/// the caller holds the connection for the duration, so the MAX(sequence)
/// read and the insert are atomic.
pub(crate) fn append_in_conn(
    conn: &rusqlite::Connection,
    run_id: &RunId,
    session_id: &SessionId,
    event_type: &str,
    payload: serde_json::Value,
) -> Result<EventRow, StoreError> {
    let max_seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), -1) FROM events WHERE run_id = ?1",
        [run_id.as_str()],
        |row| row.get(0),
    )?;

    let event_id = EventId::new();
    let now = Utc::now().to_rfc3339();
    let sequence = max_seq + 1;

    conn.execute(
        "INSERT INTO events (id, run_id, session_id, sequence, type, timestamp, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            event_id.as_str(),
            run_id.as_str(),
            session_id.as_str(),
            sequence,
            event_type,
            now,
            serde_json::to_string(&payload)?,
        ],
    )?;

    Ok(EventRow {
        id: event_id,
        run_id: run_id.clone(),
        session_id: session_id.clone(),
        sequence,
        event_type: event_type.to_string(),
        timestamp: now,
        payload,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<EventRow, StoreError> {
    let payload_str: String = row_helpers::get(row, 6, "events", "payload")?;
    let payload = row_helpers::parse_json(&payload_str, "events", "payload")?;

    Ok(EventRow {
        id: EventId::from_raw(row_helpers::get::<String>(row, 0, "events", "id")?),
        run_id: RunId::from_raw(row_helpers::get::<String>(row, 1, "events", "run_id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 2, "events", "session_id")?),
        sequence: row_helpers::get(row, 3, "events", "sequence")?,
        event_type: row_helpers::get(row, 4, "events", "type")?,
        timestamp: row_helpers::get(row, 5, "events", "timestamp")?,
        payload,
    })
}
