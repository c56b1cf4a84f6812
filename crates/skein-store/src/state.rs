use chrono::Utc;
use tracing::instrument;

use skein_core::context::{HistoryEntry, WorkflowContext};
use skein_core::ids::{RunId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::events::{self, EventRow};
use crate::row_helpers;

/// Versioned session state store.
///
/// Exactly one state row exists per session. Every `save` must present the
/// version it read; a stale version is rejected with `ConcurrencyConflict`.
/// Writers never lock. The version check is the only arbitration.
pub struct StateRepo {
    db: Database,
}

impl StateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the state row for a freshly created session, at version 0.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn init(&self, session_id: &SessionId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let empty = WorkflowContext::new();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_states
                     (session_id, version, current_phase, step_index, history, variables, shared_keys, updated_at)
                 VALUES (?1, 0, NULL, 0, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    session_id.as_str(),
                    serde_json::to_string(&empty.history)?,
                    serde_json::to_string(&empty.variables)?,
                    serde_json::to_string(&empty.shared_keys)?,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Load the current state and its version.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn load(&self, session_id: &SessionId) -> Result<(WorkflowContext, i64), StoreError> {
        self.db.with_conn(|conn| load_in_conn(conn, session_id))
    }

    /// Save a new state against the version that was read. Returns the new
    /// version. Fails with `ConcurrencyConflict` if another writer got there
    /// first.
    #[instrument(skip(self, state), fields(session_id = %session_id, version))]
    pub fn save(
        &self,
        session_id: &SessionId,
        version: i64,
        state: &WorkflowContext,
    ) -> Result<i64, StoreError> {
        self.db
            .with_tx(|conn| save_in_conn(conn, session_id, version, state))
    }

    /// Save a new state and append run events in one transaction: both
    /// commit or neither does.
    #[instrument(skip(self, state, events), fields(session_id = %session_id, run_id = %run_id, version))]
    pub fn save_with_events(
        &self,
        session_id: &SessionId,
        version: i64,
        state: &WorkflowContext,
        run_id: &RunId,
        events: &[(&str, serde_json::Value)],
    ) -> Result<(i64, Vec<EventRow>), StoreError> {
        self.db.with_tx(|conn| {
            let new_version = save_in_conn(conn, session_id, version, state)?;
            let mut appended = Vec::with_capacity(events.len());
            for (event_type, payload) in events {
                appended.push(events::append_in_conn(
                    conn,
                    run_id,
                    session_id,
                    event_type,
                    payload.clone(),
                )?);
            }
            Ok((new_version, appended))
        })
    }
}

fn load_in_conn(
    conn: &rusqlite::Connection,
    session_id: &SessionId,
) -> Result<(WorkflowContext, i64), StoreError> {
    let mut stmt = conn.prepare(
        "SELECT version, current_phase, step_index, history, variables, shared_keys
         FROM session_states WHERE session_id = ?1",
    )?;
    let mut rows = stmt.query([session_id.as_str()])?;
    match rows.next()? {
        Some(row) => {
            let version: i64 = row_helpers::get(row, 0, "session_states", "version")?;
            let history_str: String = row_helpers::get(row, 3, "session_states", "history")?;
            let variables_str: String = row_helpers::get(row, 4, "session_states", "variables")?;
            let shared_str: String = row_helpers::get(row, 5, "session_states", "shared_keys")?;

            let history: Vec<HistoryEntry> =
                row_helpers::parse_json_as(&history_str, "session_states", "history")?;
            let variables =
                row_helpers::parse_json_as(&variables_str, "session_states", "variables")?;
            let shared_keys =
                row_helpers::parse_json_as(&shared_str, "session_states", "shared_keys")?;

            let state = WorkflowContext {
                history,
                variables,
                shared_keys,
                current_phase: row_helpers::get_opt(row, 1, "session_states", "current_phase")?,
                step_index: row_helpers::get::<i64>(row, 2, "session_states", "step_index")? as u32,
            };
            Ok((state, version))
        }
        None => Err(StoreError::NotFound(format!("state for session {session_id}"))),
    }
}

fn save_in_conn(
    conn: &rusqlite::Connection,
    session_id: &SessionId,
    version: i64,
    state: &WorkflowContext,
) -> Result<i64, StoreError> {
    let now = Utc::now().to_rfc3339();
    let new_version = version + 1;

    let changed = conn.execute(
        "UPDATE session_states
         SET version = ?1, current_phase = ?2, step_index = ?3,
             history = ?4, variables = ?5, shared_keys = ?6, updated_at = ?7
         WHERE session_id = ?8 AND version = ?9",
        rusqlite::params![
            new_version,
            state.current_phase,
            state.step_index as i64,
            serde_json::to_string(&state.history)?,
            serde_json::to_string(&state.variables)?,
            serde_json::to_string(&state.shared_keys)?,
            now,
            session_id.as_str(),
            version,
        ],
    )?;

    if changed == 1 {
        return Ok(new_version);
    }

    // Distinguish a stale version from a missing row.
    let found: Option<i64> = conn
        .query_row(
            "SELECT version FROM session_states WHERE session_id = ?1",
            [session_id.as_str()],
            |row| row.get(0),
        )
        .ok();

    match found {
        Some(found) => Err(StoreError::ConcurrencyConflict {
            entity: format!("session {session_id}"),
            expected: version,
            found,
        }),
        None => Err(StoreError::NotFound(format!("state for session {session_id}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventRepo;
    use crate::runs::RunRepo;
    use crate::sessions::SessionRepo;
    use serde_json::json;

    fn setup() -> (Database, SessionId) {
        let db = Database::in_memory().unwrap();
        let sess_repo = SessionRepo::new(db.clone());
        let session = sess_repo.create("review", "test", None).unwrap();
        let repo = StateRepo::new(db.clone());
        repo.init(&session.id).unwrap();
        (db, session.id)
    }

    #[test]
    fn init_and_load() {
        let (db, sess_id) = setup();
        let repo = StateRepo::new(db);
        let (state, version) = repo.load(&sess_id).unwrap();
        assert_eq!(version, 0);
        assert!(state.variables.is_empty());
        assert!(state.history.is_empty());
        assert_eq!(state.step_index, 0);
    }

    #[test]
    fn save_bumps_version() {
        let (db, sess_id) = setup();
        let repo = StateRepo::new(db);
        let (mut state, version) = repo.load(&sess_id).unwrap();

        state.set("plan", json!("draft"));
        state.current_phase = Some("plan".into());
        let v1 = repo.save(&sess_id, version, &state).unwrap();
        assert_eq!(v1, 1);

        let (loaded, v) = repo.load(&sess_id).unwrap();
        assert_eq!(v, 1);
        assert_eq!(loaded.get("plan").unwrap(), "draft");
        assert_eq!(loaded.current_phase.as_deref(), Some("plan"));
    }

    #[test]
    fn stale_version_is_rejected() {
        let (db, sess_id) = setup();
        let repo = StateRepo::new(db);
        let (mut state, version) = repo.load(&sess_id).unwrap();

        state.set("a", json!(1));
        repo.save(&sess_id, version, &state).unwrap();

        // Second write against the same (now stale) version.
        state.set("b", json!(2));
        let result = repo.save(&sess_id, version, &state);
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { expected: 0, found: 1, .. })
        ));
    }

    #[test]
    fn two_writers_same_version_exactly_one_wins() {
        let (db, sess_id) = setup();
        let repo = std::sync::Arc::new(StateRepo::new(db));
        let (state, version) = repo.load(&sess_id).unwrap();

        let mut handles = vec![];
        for i in 0..2 {
            let repo = repo.clone();
            let sid = sess_id.clone();
            let mut state = state.clone();
            handles.push(std::thread::spawn(move || {
                state.set("writer", json!(i));
                repo.save(&sid, version, &state)
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(StoreError::ConcurrencyConflict { .. })))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 1);
    }

    #[test]
    fn save_missing_session_is_not_found() {
        let db = Database::in_memory().unwrap();
        let repo = StateRepo::new(db);
        let result = repo.save(&SessionId::new(), 0, &WorkflowContext::new());
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn save_with_events_commits_both() {
        let (db, sess_id) = setup();
        let run = RunRepo::new(db.clone()).create(&sess_id, "review", None).unwrap();
        let repo = StateRepo::new(db.clone());
        let (mut state, version) = repo.load(&sess_id).unwrap();
        state.set("out", json!("x"));

        let (new_version, appended) = repo
            .save_with_events(
                &sess_id,
                version,
                &state,
                &run.id,
                &[
                    ("phase_started", json!({"phase": "plan"})),
                    ("phase_completed", json!({"phase": "plan"})),
                ],
            )
            .unwrap();
        assert_eq!(new_version, 1);
        assert_eq!(appended.len(), 2);
        assert_eq!(appended[0].sequence, 0);
        assert_eq!(appended[1].sequence, 1);

        let events = EventRepo::new(db).list(&run.id, None, None).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn save_with_events_rolls_back_together_on_conflict() {
        let (db, sess_id) = setup();
        let run = RunRepo::new(db.clone()).create(&sess_id, "review", None).unwrap();
        let repo = StateRepo::new(db.clone());
        let (state, version) = repo.load(&sess_id).unwrap();

        // Advance the version so the save below conflicts.
        repo.save(&sess_id, version, &state).unwrap();

        let result = repo.save_with_events(
            &sess_id,
            version,
            &state,
            &run.id,
            &[("phase_started", json!({}))],
        );
        assert!(matches!(result, Err(StoreError::ConcurrencyConflict { .. })));

        // The event append must not have survived the rollback.
        let events = EventRepo::new(db).list(&run.id, None, None).unwrap();
        assert!(events.is_empty());
    }
}
