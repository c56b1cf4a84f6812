use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use skein_core::ids::{RunId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Deleted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRow {
    pub id: RunId,
    pub session_id: SessionId,
    pub mode: String,
    pub status: RunStatus,
    pub parent_run_id: Option<RunId>,
    pub branch_depth: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

pub struct RunRepo {
    db: Database,
}

impl RunRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Open a new run for a session. Branch runs carry their parent's id and
    /// depth + 1.
    #[instrument(skip(self), fields(session_id = %session_id, mode))]
    pub fn create(
        &self,
        session_id: &SessionId,
        mode: &str,
        parent_run_id: Option<&RunId>,
    ) -> Result<RunRow, StoreError> {
        let id = RunId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let branch_depth: i64 = match parent_run_id {
                Some(parent) => {
                    conn.query_row(
                        "SELECT branch_depth + 1 FROM runs WHERE id = ?1",
                        [parent.as_str()],
                        |row| row.get(0),
                    )
                    .map_err(|_| StoreError::NotFound(format!("run {parent}")))?
                }
                None => 0,
            };

            conn.execute(
                "INSERT INTO runs (id, session_id, mode, status, parent_run_id, branch_depth, started_at)
                 VALUES (?1, ?2, ?3, 'running', ?4, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    mode,
                    parent_run_id.map(RunId::as_str),
                    branch_depth,
                    now,
                ],
            )?;

            Ok(RunRow {
                id,
                session_id: session_id.clone(),
                mode: mode.to_string(),
                status: RunStatus::Running,
                parent_run_id: parent_run_id.cloned(),
                branch_depth,
                started_at: now,
                completed_at: None,
                error: None,
            })
        })
    }

    #[instrument(skip(self), fields(run_id = %id))]
    pub fn get(&self, id: &RunId) -> Result<RunRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, mode, status, parent_run_id, branch_depth,
                        started_at, completed_at, error
                 FROM runs WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_run(row),
                None => Err(StoreError::NotFound(format!("run {id}"))),
            }
        })
    }

    /// List runs for a session, oldest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_for_session(&self, session_id: &SessionId) -> Result<Vec<RunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, mode, status, parent_run_id, branch_depth,
                        started_at, completed_at, error
                 FROM runs WHERE session_id = ?1
                 ORDER BY started_at ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_run(row)?);
            }
            Ok(results)
        })
    }

    /// Close a run with a terminal status. `error` is recorded for failures.
    #[instrument(skip(self), fields(run_id = %run_id, status = %status))]
    pub fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE runs SET status = ?1, completed_at = ?2, error = ?3
                 WHERE id = ?4 AND status = 'running'",
                rusqlite::params![status.to_string(), now, error, run_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("running run {run_id}")));
            }
            Ok(())
        })
    }

    /// Cascade a session soft-delete onto its runs.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn mark_deleted_for_session(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE runs SET status = 'deleted', completed_at = COALESCE(completed_at, ?1)
                 WHERE session_id = ?2 AND status != 'deleted'",
                rusqlite::params![now, session_id.as_str()],
            )?;
            Ok(changed)
        })
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<RunRow, StoreError> {
    let status_str: String = row_helpers::get(row, 3, "runs", "status")?;

    Ok(RunRow {
        id: RunId::from_raw(row_helpers::get::<String>(row, 0, "runs", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "runs", "session_id")?),
        mode: row_helpers::get(row, 2, "runs", "mode")?,
        status: row_helpers::parse_enum(&status_str, "runs", "status")?,
        parent_run_id: row_helpers::get_opt::<String>(row, 4, "runs", "parent_run_id")?
            .map(RunId::from_raw),
        branch_depth: row_helpers::get(row, 5, "runs", "branch_depth")?,
        started_at: row_helpers::get(row, 6, "runs", "started_at")?,
        completed_at: row_helpers::get_opt(row, 7, "runs", "completed_at")?,
        error: row_helpers::get_opt(row, 8, "runs", "error")?,
    })
}
