use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use skein_core::ids::{ChannelId, RunId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A registered subscriber connection. `last_ack_sequence` starts at -1
/// (nothing acknowledged) and only moves forward.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionRow {
    pub id: ChannelId,
    pub run_id: RunId,
    pub last_ack_sequence: i64,
    pub created_at: String,
    pub last_seen_at: String,
}

pub struct ConnectionRepo {
    db: Database,
}

impl ConnectionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn register(&self, run_id: &RunId) -> Result<ConnectionRow, StoreError> {
        let id = ChannelId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO connections (id, run_id, last_ack_sequence, created_at, last_seen_at)
                 VALUES (?1, ?2, -1, ?3, ?3)",
                rusqlite::params![id.as_str(), run_id.as_str(), now],
            )?;
            Ok(ConnectionRow {
                id,
                run_id: run_id.clone(),
                last_ack_sequence: -1,
                created_at: now.clone(),
                last_seen_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(connection_id = %id))]
    pub fn get(&self, id: &ChannelId) -> Result<ConnectionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, last_ack_sequence, created_at, last_seen_at
                 FROM connections WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_connection(row),
                None => Err(StoreError::NotFound(format!("connection {id}"))),
            }
        })
    }

    /// Advance the acknowledged sequence. Regressions are ignored so a late
    /// or duplicate ack can never roll the cursor backwards.
    #[instrument(skip(self), fields(connection_id = %id, sequence))]
    pub fn ack(&self, id: &ChannelId, sequence: i64) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE connections
                 SET last_ack_sequence = MAX(last_ack_sequence, ?1), last_seen_at = ?2
                 WHERE id = ?3",
                rusqlite::params![sequence, now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("connection {id}")));
            }
            Ok(())
        })
    }

    /// Heartbeat: bump `last_seen_at`.
    #[instrument(skip(self), fields(connection_id = %id))]
    pub fn touch(&self, id: &ChannelId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE connections SET last_seen_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("connection {id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(connection_id = %id))]
    pub fn remove(&self, id: &ChannelId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM connections WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn list_for_run(&self, run_id: &RunId) -> Result<Vec<ConnectionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, last_ack_sequence, created_at, last_seen_at
                 FROM connections WHERE run_id = ?1
                 ORDER BY created_at ASC",
            )?;
            let mut rows = stmt.query([run_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_connection(row)?);
            }
            Ok(results)
        })
    }

    /// Drop connections not seen within `ttl_secs`. Returns the removed ids.
    #[instrument(skip(self))]
    pub fn remove_stale(&self, ttl_secs: i64) -> Result<Vec<ChannelId>, StoreError> {
        let cutoff = (Utc::now() - Duration::seconds(ttl_secs)).to_rfc3339();

        self.db.with_tx(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM connections WHERE last_seen_at < ?1")?;
            let mut rows = stmt.query([&cutoff])?;
            let mut stale = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row_helpers::get(row, 0, "connections", "id")?;
                stale.push(ChannelId::from_raw(id));
            }

            for id in &stale {
                conn.execute("DELETE FROM connections WHERE id = ?1", [id.as_str()])?;
            }
            Ok(stale)
        })
    }
}

fn row_to_connection(row: &rusqlite::Row<'_>) -> Result<ConnectionRow, StoreError> {
    Ok(ConnectionRow {
        id: ChannelId::from_raw(row_helpers::get::<String>(row, 0, "connections", "id")?),
        run_id: RunId::from_raw(row_helpers::get::<String>(row, 1, "connections", "run_id")?),
        last_ack_sequence: row_helpers::get(row, 2, "connections", "last_ack_sequence")?,
        created_at: row_helpers::get(row, 3, "connections", "created_at")?,
        last_seen_at: row_helpers::get(row, 4, "connections", "last_seen_at")?,
    })
}
