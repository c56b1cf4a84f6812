use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use skein_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Suspended,
    Completed,
    Expired,
    Failed,
    Deleted,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
            Self::Completed => write!(f, "completed"),
            Self::Expired => write!(f, "expired"),
            Self::Failed => write!(f, "failed"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub owner_id: Option<String>,
    pub name: String,
    pub mode: String,
    pub status: SessionStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Filter for listing sessions.
#[derive(Clone, Debug, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub owner_id: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new session in `active` status.
    #[instrument(skip(self), fields(mode, name))]
    pub fn create(
        &self,
        mode: &str,
        name: &str,
        owner_id: Option<&str>,
    ) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, owner_id, name, mode, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6)",
                rusqlite::params![id.as_str(), owner_id, name, mode, now, now],
            )?;

            Ok(SessionRow {
                id,
                owner_id: owner_id.map(str::to_string),
                name: name.to_string(),
                mode: mode.to_string(),
                status: SessionStatus::Active,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a session by ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, name, mode, status, created_at, updated_at
                 FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// List sessions, newest first. Soft-deleted sessions are excluded
    /// unless the filter asks for them explicitly.
    #[instrument(skip(self, filter))]
    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<SessionRow>, StoreError> {
        let limit = if filter.limit == 0 { 100 } else { filter.limit };

        self.db.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, owner_id, name, mode, status, created_at, updated_at
                 FROM sessions WHERE 1=1",
            );
            let mut params: Vec<String> = Vec::new();

            match &filter.status {
                Some(s) => {
                    params.push(s.to_string());
                    sql.push_str(&format!(" AND status = ?{}", params.len()));
                }
                None => {
                    sql.push_str(" AND status != 'deleted'");
                }
            }
            if let Some(owner) = &filter.owner_id {
                params.push(owner.clone());
                sql.push_str(&format!(" AND owner_id = ?{}", params.len()));
            }

            params.push(limit.to_string());
            sql.push_str(&format!(" ORDER BY created_at DESC LIMIT ?{}", params.len()));
            params.push(filter.offset.to_string());
            sql.push_str(&format!(" OFFSET ?{}", params.len()));

            let mut stmt = conn.prepare(&sql)?;
            let params_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
            let mut rows = stmt.query(params_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Update session status.
    #[instrument(skip(self), fields(session_id = %session_id, status = %status))]
    pub fn update_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.to_string(), now, session_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }
            Ok(())
        })
    }

    /// Bump last-activity time.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn touch(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, session_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Mark `active` sessions idle past the TTL as `expired`. Idempotent:
    /// the status predicate means a second pass matches nothing.
    #[instrument(skip(self))]
    pub fn expire_idle(&self, ttl_secs: i64) -> Result<Vec<SessionId>, StoreError> {
        let cutoff = (Utc::now() - Duration::seconds(ttl_secs)).to_rfc3339();
        let now = Utc::now().to_rfc3339();

        self.db.with_tx(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM sessions WHERE status = 'active' AND updated_at < ?1",
            )?;
            let mut rows = stmt.query([&cutoff])?;
            let mut expired = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row_helpers::get(row, 0, "sessions", "id")?;
                expired.push(SessionId::from_raw(id));
            }

            for id in &expired {
                conn.execute(
                    "UPDATE sessions SET status = 'expired', updated_at = ?1
                     WHERE id = ?2 AND status = 'active'",
                    rusqlite::params![now, id.as_str()],
                )?;
            }
            Ok(expired)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let status_str: String = row_helpers::get(row, 4, "sessions", "status")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        owner_id: row_helpers::get_opt(row, 1, "sessions", "owner_id")?,
        name: row_helpers::get(row, 2, "sessions", "name")?,
        mode: row_helpers::get(row, 3, "sessions", "mode")?,
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        created_at: row_helpers::get(row, 5, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 6, "sessions", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Database {
        Database::in_memory().unwrap()
    }

    #[test]
    fn create_session() {
        let repo = SessionRepo::new(setup());
        let session = repo.create("review", "nightly build review", None).unwrap();
        assert!(session.id.as_str().starts_with("sess_"));
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.mode, "review");
        assert!(session.owner_id.is_none());
    }

    #[test]
    fn get_session() {
        let repo = SessionRepo::new(setup());
        let session = repo.create("review", "s", Some("user-1")).unwrap();
        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.owner_id.as_deref(), Some("user-1"));
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = SessionRepo::new(setup());
        let result = repo.get(&SessionId::from_raw("sess_nonexistent"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_excludes_deleted_by_default() {
        let repo = SessionRepo::new(setup());
        let s1 = repo.create("m", "a", None).unwrap();
        repo.create("m", "b", None).unwrap();
        repo.update_status(&s1.id, SessionStatus::Deleted).unwrap();

        let all = repo.list(&SessionFilter::default()).unwrap();
        assert_eq!(all.len(), 1);

        let deleted = repo
            .list(&SessionFilter {
                status: Some(SessionStatus::Deleted),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(deleted.len(), 1);
    }

    #[test]
    fn list_filters_by_owner() {
        let repo = SessionRepo::new(setup());
        repo.create("m", "a", Some("alice")).unwrap();
        repo.create("m", "b", Some("bob")).unwrap();

        let filtered = repo
            .list(&SessionFilter {
                owner_id: Some("alice".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "a");
    }

    #[test]
    fn list_pagination() {
        let repo = SessionRepo::new(setup());
        for i in 0..5 {
            repo.create("m", &format!("s{i}"), None).unwrap();
        }
        let page1 = repo
            .list(&SessionFilter { limit: 2, ..Default::default() })
            .unwrap();
        assert_eq!(page1.len(), 2);
        let page3 = repo
            .list(&SessionFilter { limit: 2, offset: 4, ..Default::default() })
            .unwrap();
        assert_eq!(page3.len(), 1);
    }

    #[test]
    fn update_status() {
        let repo = SessionRepo::new(setup());
        let session = repo.create("m", "s", None).unwrap();

        repo.update_status(&session.id, SessionStatus::Suspended).unwrap();
        assert_eq!(repo.get(&session.id).unwrap().status, SessionStatus::Suspended);

        repo.update_status(&session.id, SessionStatus::Active).unwrap();
        assert_eq!(repo.get(&session.id).unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn update_status_missing_session() {
        let repo = SessionRepo::new(setup());
        let result = repo.update_status(&SessionId::new(), SessionStatus::Completed);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn expire_idle_only_hits_stale_active() {
        let db = setup();
        let repo = SessionRepo::new(db.clone());
        let stale = repo.create("m", "stale", None).unwrap();
        let fresh = repo.create("m", "fresh", None).unwrap();
        let suspended = repo.create("m", "suspended", None).unwrap();
        repo.update_status(&suspended.id, SessionStatus::Suspended).unwrap();

        // Backdate the stale session past any TTL.
        let old = (Utc::now() - Duration::hours(2)).to_rfc3339();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![old, stale.id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        let expired = repo.expire_idle(3600).unwrap();
        assert_eq!(expired, vec![stale.id.clone()]);
        assert_eq!(repo.get(&stale.id).unwrap().status, SessionStatus::Expired);
        assert_eq!(repo.get(&fresh.id).unwrap().status, SessionStatus::Active);
        assert_eq!(repo.get(&suspended.id).unwrap().status, SessionStatus::Suspended);
    }

    #[test]
    fn expire_idle_is_idempotent() {
        let db = setup();
        let repo = SessionRepo::new(db.clone());
        let stale = repo.create("m", "stale", None).unwrap();
        let old = (Utc::now() - Duration::hours(2)).to_rfc3339();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![old, stale.id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        let first = repo.expire_idle(3600).unwrap();
        assert_eq!(first.len(), 1);
        let second = repo.expire_idle(3600).unwrap();
        assert!(second.is_empty());
        assert_eq!(repo.get(&stale.id).unwrap().status, SessionStatus::Expired);
    }

    #[test]
    fn invalid_session_status_returns_error() {
        let db = setup();
        let session_id = SessionId::new();
        let now = Utc::now().to_rfc3339();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, name, mode, status, created_at, updated_at)
                 VALUES (?1, 'n', 'm', 'INVALID_STATUS', ?2, ?2)",
                rusqlite::params![session_id.as_str(), now],
            )?;
            Ok(())
        })
        .unwrap();

        let repo = SessionRepo::new(db);
        let result = repo.get(&session_id);
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }
}
