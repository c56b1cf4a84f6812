use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use skein_core::approval::Decision;
use skein_core::context::WorkflowContext;
use skein_core::events::RunEvent;
use skein_core::ids::{ApprovalId, RunId, SessionId};
use skein_store::approvals::ApprovalRepo;
use skein_store::events::EventRow;
use skein_store::runs::{RunRepo, RunRow, RunStatus};
use skein_store::sessions::{SessionFilter, SessionRepo, SessionRow, SessionStatus};
use skein_store::state::StateRepo;
use skein_store::{Database, StoreError};

use crate::channel::ChannelManager;
use crate::error::EngineError;

#[derive(Clone, Debug)]
pub struct CreateSessionOptions {
    pub name: String,
    pub owner_id: Option<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct SweepConfig {
    pub interval_secs: u64,
    /// Idle time after which an active session is expired.
    pub session_ttl_secs: i64,
    /// Decision applied to approvals that pass their deadline.
    pub approval_default: Decision,
    /// Silence after which a connection row is pruned.
    pub connection_ttl_secs: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            session_ttl_secs: 24 * 60 * 60,
            approval_default: Decision::Rejected,
            connection_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub expired_sessions: usize,
    pub expired_approvals: usize,
    pub dropped_connections: usize,
}

/// Session lifecycle owner.
///
/// All state writes go through `update_state*`, which implements the
/// read-version / mutate / save loop with a single retry on a concurrency
/// conflict. Callers never touch versions directly.
pub struct SessionCoordinator {
    sessions: SessionRepo,
    states: StateRepo,
    runs: RunRepo,
    approvals: ApprovalRepo,
}

impl SessionCoordinator {
    pub fn new(db: Database) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            states: StateRepo::new(db.clone()),
            runs: RunRepo::new(db.clone()),
            approvals: ApprovalRepo::new(db),
        }
    }

    /// Create a session and its state row at version 0.
    #[instrument(skip(self, options), fields(mode))]
    pub fn create(
        &self,
        mode: &str,
        options: CreateSessionOptions,
    ) -> Result<SessionRow, EngineError> {
        let session = self
            .sessions
            .create(mode, &options.name, options.owner_id.as_deref())?;
        self.states.init(&session.id)?;
        info!(session_id = %session.id, mode, "session created");
        Ok(session)
    }

    pub fn status(&self, session_id: &SessionId) -> Result<SessionRow, EngineError> {
        Ok(self.sessions.get(session_id)?)
    }

    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<SessionRow>, EngineError> {
        Ok(self.sessions.list(filter)?)
    }

    /// Suspend an active session. In-flight runs stop at the next phase
    /// boundary.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn suspend(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let session = self.sessions.get(session_id)?;
        match session.status {
            SessionStatus::Active => {
                self.sessions.update_status(session_id, SessionStatus::Suspended)?;
                Ok(())
            }
            status => Err(EngineError::NotSuspendable {
                session: session_id.as_str().to_string(),
                status: status.to_string(),
            }),
        }
    }

    /// Resume a session and return its current state. Resuming an already
    /// active session is a no-op, not an error.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn resume(
        &self,
        session_id: &SessionId,
    ) -> Result<(WorkflowContext, i64), EngineError> {
        let session = self.sessions.get(session_id)?;
        match session.status {
            SessionStatus::Active => {}
            SessionStatus::Suspended => {
                self.sessions.update_status(session_id, SessionStatus::Active)?;
            }
            status => {
                return Err(EngineError::NotSuspendable {
                    session: session_id.as_str().to_string(),
                    status: status.to_string(),
                })
            }
        }
        Ok(self.states.load(session_id)?)
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn complete(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let session = self.sessions.get(session_id)?;
        match session.status {
            SessionStatus::Active | SessionStatus::Suspended => {
                self.sessions.update_status(session_id, SessionStatus::Completed)?;
                Ok(())
            }
            status => Err(EngineError::NotSuspendable {
                session: session_id.as_str().to_string(),
                status: status.to_string(),
            }),
        }
    }

    /// Soft-delete a session: marks it deleted, cascades the status to its
    /// runs, and force-cancels any pending approvals. Events stay in the
    /// log. Returns the cancelled approval ids.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn delete(&self, session_id: &SessionId) -> Result<Vec<ApprovalId>, EngineError> {
        self.sessions.get(session_id)?;
        let cancelled = self.approvals.cancel_pending_for_session(session_id)?;
        self.runs.mark_deleted_for_session(session_id)?;
        self.sessions.update_status(session_id, SessionStatus::Deleted)?;
        info!(session_id = %session_id, cancelled = cancelled.len(), "session deleted");
        Ok(cancelled)
    }

    pub fn load_state(
        &self,
        session_id: &SessionId,
    ) -> Result<(WorkflowContext, i64), EngineError> {
        Ok(self.states.load(session_id)?)
    }

    /// Read-mutate-save with a single retry: on a version conflict the
    /// current state is re-read and the mutator re-applied once, then the
    /// conflict surfaces.
    #[instrument(skip(self, mutate), fields(session_id = %session_id))]
    pub fn update_state<F>(
        &self,
        session_id: &SessionId,
        mutate: F,
    ) -> Result<(WorkflowContext, i64), EngineError>
    where
        F: Fn(&mut WorkflowContext),
    {
        let (mut state, version) = self.states.load(session_id)?;
        mutate(&mut state);

        match self.states.save(session_id, version, &state) {
            Ok(new_version) => Ok((state, new_version)),
            Err(StoreError::ConcurrencyConflict { .. }) => {
                let (mut state, version) = self.states.load(session_id)?;
                mutate(&mut state);
                let new_version = self.states.save(session_id, version, &state)?;
                Ok((state, new_version))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Like `update_state`, but the save and the given run events commit in
    /// one transaction. The returned rows have not been pushed to observers.
    #[instrument(skip(self, mutate, events), fields(session_id = %session_id, run_id = %run_id))]
    pub fn update_state_with_events<F>(
        &self,
        session_id: &SessionId,
        run_id: &RunId,
        mutate: F,
        events: &[RunEvent],
    ) -> Result<(i64, Vec<EventRow>), EngineError>
    where
        F: Fn(&mut WorkflowContext),
    {
        let pairs: Vec<(&str, serde_json::Value)> = events
            .iter()
            .map(|e| {
                serde_json::to_value(e)
                    .map(|v| (e.event_type(), v))
                    .map_err(|err| EngineError::Internal(format!("event serialization: {err}")))
            })
            .collect::<Result<_, _>>()?;

        let (mut state, version) = self.states.load(session_id)?;
        mutate(&mut state);

        match self
            .states
            .save_with_events(session_id, version, &state, run_id, &pairs)
        {
            Ok(result) => Ok(result),
            Err(StoreError::ConcurrencyConflict { .. }) => {
                let (mut state, version) = self.states.load(session_id)?;
                mutate(&mut state);
                Ok(self
                    .states
                    .save_with_events(session_id, version, &state, run_id, &pairs)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open a run on an active session.
    #[instrument(skip(self), fields(session_id = %session_id, mode))]
    pub fn start_run(
        &self,
        session_id: &SessionId,
        mode: &str,
        parent_run_id: Option<&RunId>,
    ) -> Result<RunRow, EngineError> {
        let session = self.sessions.get(session_id)?;
        if session.status != SessionStatus::Active {
            return Err(EngineError::NotSuspendable {
                session: session_id.as_str().to_string(),
                status: session.status.to_string(),
            });
        }
        let run = self.runs.create(session_id, mode, parent_run_id)?;
        self.sessions.touch(session_id)?;
        Ok(run)
    }

    #[instrument(skip(self), fields(run_id = %run_id, status = %status))]
    pub fn finish_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), EngineError> {
        self.runs.finish(run_id, status, error)?;
        Ok(())
    }

    pub fn run(&self, run_id: &RunId) -> Result<RunRow, EngineError> {
        Ok(self.runs.get(run_id)?)
    }

    pub fn runs_for_session(&self, session_id: &SessionId) -> Result<Vec<RunRow>, EngineError> {
        Ok(self.runs.list_for_session(session_id)?)
    }

    /// One sweep pass. Every step is idempotent: all three act through
    /// status- or timestamp-guarded predicates, so re-running over
    /// already-final state changes nothing.
    #[instrument(skip(self, channels, config))]
    pub fn sweep_once(
        &self,
        channels: &ChannelManager,
        config: &SweepConfig,
    ) -> Result<SweepReport, EngineError> {
        let expired_sessions = self.sessions.expire_idle(config.session_ttl_secs)?;
        let expired_approvals = self.approvals.expire_due(config.approval_default)?;
        let dropped = channels.sweep_stale(config.connection_ttl_secs)?;

        Ok(SweepReport {
            expired_sessions: expired_sessions.len(),
            expired_approvals: expired_approvals.len(),
            dropped_connections: dropped.len(),
        })
    }

    /// Run the sweep on a fixed interval until the token is cancelled.
    pub fn spawn_sweep(
        self: &Arc<Self>,
        channels: Arc<ChannelManager>,
        config: SweepConfig,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match coordinator.sweep_once(&channels, &config) {
                            Ok(report) => {
                                if report.expired_sessions > 0
                                    || report.expired_approvals > 0
                                    || report.dropped_connections > 0
                                {
                                    info!(
                                        expired_sessions = report.expired_sessions,
                                        expired_approvals = report.expired_approvals,
                                        dropped_connections = report.dropped_connections,
                                        "sweep pass"
                                    );
                                }
                            }
                            Err(e) => warn!(error = %e, "sweep pass failed"),
                        }
                    }
                }
            }
        })
    }
}
