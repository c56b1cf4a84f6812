use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use skein_core::approval::{Decision, Resolution};
use skein_core::events::RunEvent;
use skein_core::ids::{ApprovalId, RunId, SessionId};
use skein_store::approvals::{ApprovalRepo, ApprovalRow, ApprovalStatus, ResolveOutcome};
use skein_store::runs::RunRepo;
use skein_store::Database;

use crate::channel::ChannelManager;
use crate::error::EngineError;

#[derive(Clone, Copy, Debug)]
pub struct GateConfig {
    /// Decision applied when a request expires without a human resolution.
    pub default_on_expiry: Decision,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            default_on_expiry: Decision::Rejected,
        }
    }
}

/// Exactly-once human approval checkpoint.
///
/// A request is resolved by whichever arrives first: a human decision, the
/// stored deadline, or the waiter's own timeout. All three paths converge on
/// conditional updates against the `pending` status, so only one outcome
/// ever lands.
pub struct ApprovalGate {
    approvals: ApprovalRepo,
    runs: RunRepo,
    channels: Arc<ChannelManager>,
    waiters: DashMap<String, Arc<Notify>>,
    config: GateConfig,
}

impl ApprovalGate {
    pub fn new(db: Database, channels: Arc<ChannelManager>, config: GateConfig) -> Self {
        Self {
            approvals: ApprovalRepo::new(db.clone()),
            runs: RunRepo::new(db),
            channels,
            waiters: DashMap::new(),
            config,
        }
    }

    /// Open a pending approval request and announce it to observers.
    #[instrument(skip(self, snapshot, options), fields(run_id = %run_id, checkpoint))]
    pub fn request(
        &self,
        run_id: &RunId,
        checkpoint: &str,
        snapshot: serde_json::Value,
        options: &[String],
        deadline: DateTime<Utc>,
    ) -> Result<ApprovalRow, EngineError> {
        let row = self
            .approvals
            .create(run_id, checkpoint, snapshot, options, deadline)?;

        let session_id = self.runs.get(run_id)?.session_id;
        self.channels.publish(
            run_id,
            &session_id,
            &RunEvent::ApprovalRequested {
                session_id: session_id.clone(),
                run_id: run_id.clone(),
                approval_id: row.id.clone(),
                checkpoint: checkpoint.to_string(),
            },
        )?;
        Ok(row)
    }

    /// Resolve a pending request with a raw human token.
    ///
    /// The token is normalized through `Decision` before anything else
    /// happens; an unrecognized token is an error and touches no state.
    #[instrument(skip(self), fields(approval_id = %id, raw_token))]
    pub fn resolve(
        &self,
        id: &ApprovalId,
        raw_token: &str,
        feedback: Option<&str>,
    ) -> Result<Resolution, EngineError> {
        let decision = Decision::normalize(raw_token)?;

        match self.approvals.resolve_once(id, decision, feedback)? {
            ResolveOutcome::Resolved(row) => {
                info!(approval_id = %id, decision = %decision, "approval resolved");
                self.announce(&row, decision);
                self.wake(id);
                Ok(Resolution::human(decision, feedback.map(str::to_string)))
            }
            ResolveOutcome::AlreadyResolved(_) => {
                Err(EngineError::AlreadyResolved(id.as_str().to_string()))
            }
            ResolveOutcome::Expired(_) => {
                Err(EngineError::ApprovalExpired(id.as_str().to_string()))
            }
        }
    }

    /// Park until the request is resolved, its stored deadline passes, or
    /// `timeout` elapses. The timeout bounds only this wait: crossing it
    /// returns `ApprovalTimeout` and leaves the request pending for a human
    /// or the sweep. Only the stored deadline finalizes the request as
    /// expired with the default decision.
    #[instrument(skip(self), fields(approval_id = %id))]
    pub async fn await_resolution(
        &self,
        id: &ApprovalId,
        timeout: Duration,
    ) -> Result<Resolution, EngineError> {
        let notify = self
            .waiters
            .entry(id.as_str().to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        let hard_stop = tokio::time::Instant::now() + timeout;

        loop {
            let row = self.approvals.get(id)?;
            match row.status {
                ApprovalStatus::Resolved => {
                    self.waiters.remove(id.as_str());
                    let decision = row.resolution.ok_or_else(|| {
                        EngineError::Internal(format!("resolved approval {id} has no decision"))
                    })?;
                    return Ok(Resolution::human(decision, row.feedback));
                }
                ApprovalStatus::Expired => {
                    self.waiters.remove(id.as_str());
                    let decision = row.resolution.unwrap_or(self.config.default_on_expiry);
                    return Ok(Resolution::expired_with(decision));
                }
                ApprovalStatus::Pending => {}
            }

            let stored = DateTime::parse_from_rfc3339(&row.deadline)
                .map_err(|e| EngineError::Internal(format!("bad deadline on {id}: {e}")))?
                .with_timezone(&Utc);

            if Utc::now() >= stored {
                // Past the stored deadline. Try to win the expiry; losing
                // means someone resolved concurrently, so loop and re-read.
                if let Some(expired) =
                    self.approvals.expire_one(id, self.config.default_on_expiry)?
                {
                    warn!(approval_id = %id, "approval expired, applying default decision");
                    self.announce(&expired, self.config.default_on_expiry);
                    self.waiters.remove(id.as_str());
                    return Ok(Resolution::expired_with(self.config.default_on_expiry));
                }
                continue;
            }

            let now = tokio::time::Instant::now();
            if now >= hard_stop {
                // Our wait is over but the request is still live. Leave it
                // pending; the row is untouched.
                self.waiters.remove(id.as_str());
                return Err(EngineError::ApprovalTimeout(id.as_str().to_string()));
            }

            let until_stored = (stored - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            let wake = hard_stop.min(now + until_stored);
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Force-resolve every pending approval under a session to cancelled and
    /// wake any parked waiters. Invoked on session deletion.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn cancel_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ApprovalId>, EngineError> {
        let cancelled = self.approvals.cancel_pending_for_session(session_id)?;
        for id in &cancelled {
            self.wake(id);
        }
        Ok(cancelled)
    }

    fn announce(&self, row: &ApprovalRow, decision: Decision) {
        let session_id = match self.runs.get(&row.run_id) {
            Ok(run) => run.session_id,
            Err(e) => {
                warn!(approval_id = %row.id, error = %e, "could not announce resolution");
                return;
            }
        };
        let event = RunEvent::ApprovalResolved {
            session_id: session_id.clone(),
            run_id: row.run_id.clone(),
            approval_id: row.id.clone(),
            decision,
        };
        if let Err(e) = self.channels.publish(&row.run_id, &session_id, &event) {
            warn!(approval_id = %row.id, error = %e, "resolution event publish failed");
        }
    }

    fn wake(&self, id: &ApprovalId) {
        if let Some(notify) = self.waiters.get(id.as_str()) {
            notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use skein_store::sessions::SessionRepo;

    fn setup() -> (Database, Arc<ApprovalGate>, RunId) {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create("review", "test", None).unwrap();
        let run = RunRepo::new(db.clone()).create(&session.id, "review", None).unwrap();
        let channels = Arc::new(ChannelManager::new(db.clone(), ChannelConfig::default()));
        let gate = Arc::new(ApprovalGate::new(db.clone(), channels, GateConfig::default()));
        (db, gate, run.id)
    }

    fn request(gate: &ApprovalGate, run_id: &RunId, minutes: i64) -> ApprovalRow {
        gate.request(
            run_id,
            "plan_review",
            json!({"plan": "..."}),
            &["approved".to_string(), "rejected".to_string()],
            Utc::now() + ChronoDuration::minutes(minutes),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn resolve_normalizes_token_synonyms() {
        let (_db, gate, run_id) = setup();

        let a = request(&gate, &run_id, 10);
        let r = gate.resolve(&a.id, "approve", None).unwrap();
        assert_eq!(r.decision, Decision::Approved);
        assert!(!r.expired);

        let b = request(&gate, &run_id, 10);
        let r = gate.resolve(&b.id, "APPROVED", Some("ship it")).unwrap();
        assert_eq!(r.decision, Decision::Approved);
        assert_eq!(r.feedback.as_deref(), Some("ship it"));
    }

    #[tokio::test]
    async fn unknown_token_is_rejected_without_touching_state() {
        let (db, gate, run_id) = setup();
        let row = request(&gate, &run_id, 10);

        let result = gate.resolve(&row.id, "approvedd", None);
        assert!(matches!(result, Err(EngineError::UnknownResolution(_))));

        let fetched = ApprovalRepo::new(db).get(&row.id).unwrap();
        assert_eq!(fetched.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn second_resolution_fails_already_resolved() {
        let (_db, gate, run_id) = setup();
        let row = request(&gate, &run_id, 10);

        gate.resolve(&row.id, "approved", None).unwrap();
        let second = gate.resolve(&row.id, "rejected", None);
        assert!(matches!(second, Err(EngineError::AlreadyResolved(_))));
    }

    #[tokio::test]
    async fn waiter_wakes_on_human_resolution() {
        let (_db, gate, run_id) = setup();
        let row = request(&gate, &run_id, 10);

        let resolver = {
            let gate = gate.clone();
            let id = row.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                gate.resolve(&id, "approved", Some("go")).unwrap();
            })
        };

        let resolution = gate
            .await_resolution(&row.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resolution.decision, Decision::Approved);
        assert_eq!(resolution.feedback.as_deref(), Some("go"));
        assert!(!resolution.expired);
        resolver.await.unwrap();
    }

    #[tokio::test]
    async fn stored_deadline_expires_with_default_decision() {
        let (db, gate, run_id) = setup();
        let row = gate
            .request(
                &run_id,
                "plan_review",
                json!({}),
                &["approved".to_string()],
                Utc::now() - ChronoDuration::seconds(1),
            )
            .unwrap();

        let resolution = gate
            .await_resolution(&row.id, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(resolution.expired);
        assert_eq!(resolution.decision, Decision::Rejected);

        let fetched = ApprovalRepo::new(db).get(&row.id).unwrap();
        assert_eq!(fetched.status, ApprovalStatus::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_timeout_leaves_request_pending() {
        let (db, gate, run_id) = setup();
        let row = request(&gate, &run_id, 60);

        // The wait ends, but the deadline is still an hour out: the row
        // must not be finalized by the waiter.
        let result = gate.await_resolution(&row.id, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(EngineError::ApprovalTimeout(_))));

        let fetched = ApprovalRepo::new(db).get(&row.id).unwrap();
        assert_eq!(fetched.status, ApprovalStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn human_can_resolve_after_waiter_timeout() {
        let (_db, gate, run_id) = setup();
        let row = request(&gate, &run_id, 60);

        let result = gate.await_resolution(&row.id, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(EngineError::ApprovalTimeout(_))));

        let resolution = gate.resolve(&row.id, "approved", Some("late but valid")).unwrap();
        assert_eq!(resolution.decision, Decision::Approved);
        assert!(!resolution.expired);
    }

    #[tokio::test]
    async fn resolving_after_expiry_fails() {
        let (_db, gate, run_id) = setup();
        let row = gate
            .request(
                &run_id,
                "plan_review",
                json!({}),
                &["approved".to_string()],
                Utc::now() - ChronoDuration::seconds(1),
            )
            .unwrap();

        gate.await_resolution(&row.id, Duration::from_secs(1)).await.unwrap();

        let late = gate.resolve(&row.id, "approved", None);
        assert!(matches!(late, Err(EngineError::ApprovalExpired(_))));
    }

    #[tokio::test]
    async fn cancel_for_session_wakes_waiters() {
        let (db, gate, run_id) = setup();
        let session_id = RunRepo::new(db).get(&run_id).unwrap().session_id;
        let row = request(&gate, &run_id, 10);

        let waiter = {
            let gate = gate.clone();
            let id = row.id.clone();
            tokio::spawn(async move { gate.await_resolution(&id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancelled = gate.cancel_for_session(&session_id).unwrap();
        assert_eq!(cancelled.len(), 1);

        let resolution = waiter.await.unwrap().unwrap();
        assert_eq!(resolution.decision, Decision::Cancelled);
    }
}
