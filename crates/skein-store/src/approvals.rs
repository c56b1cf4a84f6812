use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use skein_core::approval::Decision;
use skein_core::ids::{ApprovalId, RunId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Resolved,
    Expired,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Resolved => write!(f, "resolved"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown approval status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalRow {
    pub id: ApprovalId,
    pub run_id: RunId,
    pub checkpoint: String,
    pub context_snapshot: serde_json::Value,
    pub options: Vec<String>,
    pub status: ApprovalStatus,
    pub deadline: String,
    pub resolution: Option<Decision>,
    pub feedback: Option<String>,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

/// Result of a resolution attempt. At most one attempt ever lands; the
/// winner is decided by a single conditional UPDATE.
#[derive(Debug)]
pub enum ResolveOutcome {
    /// This call won: the request transitioned pending → resolved.
    Resolved(ApprovalRow),
    /// Someone else resolved it first.
    AlreadyResolved(ApprovalRow),
    /// The deadline sweep finalized it before this call.
    Expired(ApprovalRow),
}

pub struct ApprovalRepo {
    db: Database,
}

impl ApprovalRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a pending approval request.
    #[instrument(skip(self, context_snapshot, options), fields(run_id = %run_id, checkpoint))]
    pub fn create(
        &self,
        run_id: &RunId,
        checkpoint: &str,
        context_snapshot: serde_json::Value,
        options: &[String],
        deadline: DateTime<Utc>,
    ) -> Result<ApprovalRow, StoreError> {
        let id = ApprovalId::new();
        let now = Utc::now().to_rfc3339();
        let deadline = deadline.to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO approvals
                     (id, run_id, checkpoint, context_snapshot, options, status, deadline, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    run_id.as_str(),
                    checkpoint,
                    serde_json::to_string(&context_snapshot)?,
                    serde_json::to_string(options)?,
                    deadline,
                    now,
                ],
            )?;

            Ok(ApprovalRow {
                id,
                run_id: run_id.clone(),
                checkpoint: checkpoint.to_string(),
                context_snapshot,
                options: options.to_vec(),
                status: ApprovalStatus::Pending,
                deadline,
                resolution: None,
                feedback: None,
                created_at: now,
                resolved_at: None,
            })
        })
    }

    #[instrument(skip(self), fields(approval_id = %id))]
    pub fn get(&self, id: &ApprovalId) -> Result<ApprovalRow, StoreError> {
        self.db.with_conn(|conn| get_in_conn(conn, id))
    }

    /// Resolve a pending request exactly once. The conditional UPDATE is the
    /// arbitration point: whichever caller flips `pending` wins; everyone
    /// else observes the already-final row.
    #[instrument(skip(self), fields(approval_id = %id, decision = %decision))]
    pub fn resolve_once(
        &self,
        id: &ApprovalId,
        decision: Decision,
        feedback: Option<&str>,
    ) -> Result<ResolveOutcome, StoreError> {
        self.db.with_tx(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE approvals
                 SET status = 'resolved', resolution = ?1, feedback = ?2, resolved_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                rusqlite::params![decision.to_string(), feedback, now, id.as_str()],
            )?;

            let row = get_in_conn(conn, id)?;
            if changed == 1 {
                Ok(ResolveOutcome::Resolved(row))
            } else {
                match row.status {
                    ApprovalStatus::Expired => Ok(ResolveOutcome::Expired(row)),
                    _ => Ok(ResolveOutcome::AlreadyResolved(row)),
                }
            }
        })
    }

    /// Finalize all pending requests past their deadline with the default
    /// decision. Idempotent: already-final rows never match the predicate.
    #[instrument(skip(self))]
    pub fn expire_due(&self, default: Decision) -> Result<Vec<ApprovalRow>, StoreError> {
        let now = Utc::now().to_rfc3339();

        self.db.with_tx(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM approvals WHERE status = 'pending' AND deadline < ?1",
            )?;
            let mut rows = stmt.query([&now])?;
            let mut due = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row_helpers::get(row, 0, "approvals", "id")?;
                due.push(ApprovalId::from_raw(id));
            }

            let mut expired = Vec::with_capacity(due.len());
            for id in &due {
                conn.execute(
                    "UPDATE approvals
                     SET status = 'expired', resolution = ?1, resolved_at = ?2
                     WHERE id = ?3 AND status = 'pending'",
                    rusqlite::params![default.to_string(), now, id.as_str()],
                )?;
                expired.push(get_in_conn(conn, id)?);
            }
            Ok(expired)
        })
    }

    /// Expire a single pending request with the default decision. Returns
    /// `None` when the request was no longer pending (someone resolved or
    /// expired it first).
    #[instrument(skip(self), fields(approval_id = %id))]
    pub fn expire_one(
        &self,
        id: &ApprovalId,
        default: Decision,
    ) -> Result<Option<ApprovalRow>, StoreError> {
        self.db.with_tx(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE approvals
                 SET status = 'expired', resolution = ?1, resolved_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                rusqlite::params![default.to_string(), now, id.as_str()],
            )?;
            if changed == 1 {
                Ok(Some(get_in_conn(conn, id)?))
            } else {
                Ok(None)
            }
        })
    }

    /// Force-resolve every pending approval under a session to `cancelled`.
    /// Invoked when the session is deleted.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn cancel_pending_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ApprovalId>, StoreError> {
        self.db.with_tx(|conn| {
            let mut stmt = conn.prepare(
                "SELECT a.id FROM approvals a
                 JOIN runs r ON r.id = a.run_id
                 WHERE r.session_id = ?1 AND a.status = 'pending'",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut pending = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row_helpers::get(row, 0, "approvals", "id")?;
                pending.push(ApprovalId::from_raw(id));
            }

            let now = Utc::now().to_rfc3339();
            for id in &pending {
                conn.execute(
                    "UPDATE approvals
                     SET status = 'resolved', resolution = 'cancelled', resolved_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    rusqlite::params![now, id.as_str()],
                )?;
            }
            Ok(pending)
        })
    }

    /// Pending approvals for a run, oldest first.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn pending_for_run(&self, run_id: &RunId) -> Result<Vec<ApprovalRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, checkpoint, context_snapshot, options, status,
                        deadline, resolution, feedback, created_at, resolved_at
                 FROM approvals WHERE run_id = ?1 AND status = 'pending'
                 ORDER BY created_at ASC",
            )?;
            let mut rows = stmt.query([run_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_approval(row)?);
            }
            Ok(results)
        })
    }
}

fn get_in_conn(
    conn: &rusqlite::Connection,
    id: &ApprovalId,
) -> Result<ApprovalRow, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, run_id, checkpoint, context_snapshot, options, status,
                deadline, resolution, feedback, created_at, resolved_at
         FROM approvals WHERE id = ?1",
    )?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_approval(row),
        None => Err(StoreError::NotFound(format!("approval {id}"))),
    }
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> Result<ApprovalRow, StoreError> {
    let snapshot_str: String = row_helpers::get(row, 3, "approvals", "context_snapshot")?;
    let options_str: String = row_helpers::get(row, 4, "approvals", "options")?;
    let status_str: String = row_helpers::get(row, 5, "approvals", "status")?;
    let resolution_str: Option<String> = row_helpers::get_opt(row, 7, "approvals", "resolution")?;

    let resolution = match resolution_str {
        Some(raw) => Some(row_helpers::parse_enum(&raw, "approvals", "resolution")?),
        None => None,
    };

    Ok(ApprovalRow {
        id: ApprovalId::from_raw(row_helpers::get::<String>(row, 0, "approvals", "id")?),
        run_id: RunId::from_raw(row_helpers::get::<String>(row, 1, "approvals", "run_id")?),
        checkpoint: row_helpers::get(row, 2, "approvals", "checkpoint")?,
        context_snapshot: row_helpers::parse_json(&snapshot_str, "approvals", "context_snapshot")?,
        options: row_helpers::parse_json_as(&options_str, "approvals", "options")?,
        status: row_helpers::parse_enum(&status_str, "approvals", "status")?,
        deadline: row_helpers::get(row, 6, "approvals", "deadline")?,
        resolution,
        feedback: row_helpers::get_opt(row, 8, "approvals", "feedback")?,
        created_at: row_helpers::get(row, 9, "approvals", "created_at")?,
        resolved_at: row_helpers::get_opt(row, 10, "approvals", "resolved_at")?,
    })
}
