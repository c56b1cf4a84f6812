use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, instrument, warn};

use skein_core::context::{HistoryEntry, WorkflowContext};
use skein_core::events::RunEvent;
use skein_core::ids::SessionId;
use skein_store::runs::{RunRow, RunStatus};
use skein_store::sessions::SessionStatus;

use crate::approval::ApprovalGate;
use crate::channel::ChannelManager;
use crate::coordinator::SessionCoordinator;
use crate::error::EngineError;
use crate::phase::{Phase, PhaseServices, PhaseStatus};

/// Drives a phase sequence against a session.
///
/// Per phase boundary: suspension check, skip predicate, input validation,
/// execute, then one transactional persist of the merged context plus the
/// completion event. A failure halts the sequence; there is no executor-level
/// retry. Resumption is positional: a later run continues from the persisted
/// `step_index`.
pub struct PhaseExecutor {
    coordinator: Arc<SessionCoordinator>,
    channels: Arc<ChannelManager>,
    gate: Arc<ApprovalGate>,
}

impl PhaseExecutor {
    pub fn new(
        coordinator: Arc<SessionCoordinator>,
        channels: Arc<ChannelManager>,
        gate: Arc<ApprovalGate>,
    ) -> Self {
        Self {
            coordinator,
            channels,
            gate,
        }
    }

    /// Open a run and execute the sequence to completion (or until it halts).
    #[instrument(skip(self, phases, seed), fields(session_id = %session_id, mode))]
    pub async fn run(
        &self,
        session_id: &SessionId,
        mode: &str,
        phases: &[Arc<dyn Phase>],
        seed: Option<&BTreeMap<String, Value>>,
    ) -> Result<WorkflowContext, EngineError> {
        let run = self.coordinator.start_run(session_id, mode, None)?;
        self.execute(&run, phases, seed).await
    }

    /// Execute a phase sequence inside an already-opened run.
    #[instrument(skip(self, run, phases, seed), fields(run_id = %run.id, session_id = %run.session_id))]
    pub async fn execute(
        &self,
        run: &RunRow,
        phases: &[Arc<dyn Phase>],
        seed: Option<&BTreeMap<String, Value>>,
    ) -> Result<WorkflowContext, EngineError> {
        let session_id = &run.session_id;

        if let Some(seed) = seed {
            self.coordinator.update_state(session_id, |ctx| {
                for (key, value) in seed {
                    ctx.set(key.clone(), value.clone());
                }
            })?;
        }

        self.channels.publish(
            &run.id,
            session_id,
            &RunEvent::RunStarted {
                session_id: session_id.clone(),
                run_id: run.id.clone(),
                mode: run.mode.clone(),
            },
        )?;

        let (mut ctx, _) = self.coordinator.load_state(session_id)?;
        let start = ctx.step_index as usize;
        if start > 0 {
            self.channels.publish(
                &run.id,
                session_id,
                &RunEvent::SessionResumed {
                    session_id: session_id.clone(),
                    run_id: run.id.clone(),
                },
            )?;
        }

        let services = PhaseServices {
            session_id: session_id.clone(),
            run_id: run.id.clone(),
            channels: Arc::clone(&self.channels),
            gate: Arc::clone(&self.gate),
        };

        for (index, phase) in phases.iter().enumerate().skip(start) {
            let step_index = index as u32;
            let name = phase.name().to_string();

            // Suspension only takes effect at phase boundaries; a phase
            // already executing finishes first.
            let session = self.coordinator.status(session_id)?;
            match session.status {
                SessionStatus::Active => {}
                SessionStatus::Suspended => {
                    info!(session_id = %session_id, run_id = %run.id, "run paused at phase boundary");
                    self.channels.publish(
                        &run.id,
                        session_id,
                        &RunEvent::SessionSuspended {
                            session_id: session_id.clone(),
                            run_id: run.id.clone(),
                        },
                    )?;
                    self.coordinator.finish_run(&run.id, RunStatus::Cancelled, None)?;
                    self.channels.release_run(&run.id);
                    return Ok(ctx);
                }
                _ => {
                    self.coordinator.finish_run(&run.id, RunStatus::Cancelled, None)?;
                    self.channels.release_run(&run.id);
                    return Err(EngineError::Cancelled);
                }
            }

            if phase.should_skip(&ctx) {
                let event = RunEvent::PhaseSkipped {
                    session_id: session_id.clone(),
                    run_id: run.id.clone(),
                    phase: name.clone(),
                    step_index,
                };
                let (_, rows) = self.coordinator.update_state_with_events(
                    session_id,
                    &run.id,
                    |c| {
                        c.step_index = step_index + 1;
                        c.push_history(HistoryEntry::new(
                            Some(&name),
                            PhaseStatus::Skipped.to_string(),
                        ));
                    },
                    &[event],
                )?;
                for row in &rows {
                    self.channels.forward(row);
                }
                ctx = self.coordinator.load_state(session_id)?.0;
                continue;
            }

            let missing = ctx.missing_keys(phase.required_inputs());
            if !missing.is_empty() {
                let message = format!("missing required inputs: {missing:?}");
                self.fail_run(run, &name, &message)?;
                return Err(EngineError::Validation {
                    phase: name,
                    missing,
                });
            }

            self.channels.publish(
                &run.id,
                session_id,
                &RunEvent::PhaseStarted {
                    session_id: session_id.clone(),
                    run_id: run.id.clone(),
                    phase: name.clone(),
                    step_index,
                },
            )?;

            ctx.current_phase = Some(name.clone());
            let output = match phase.execute(&ctx, &services).await {
                Ok(output) => output,
                Err(e) => {
                    let message = e.to_string();
                    warn!(run_id = %run.id, phase = %name, error = %message, "phase failed");
                    self.fail_run(run, &name, &message)?;
                    return Err(EngineError::PhaseFailed {
                        phase: name,
                        message,
                    });
                }
            };

            let event = RunEvent::PhaseCompleted {
                session_id: session_id.clone(),
                run_id: run.id.clone(),
                phase: name.clone(),
                step_index,
            };
            let (_, rows) = self.coordinator.update_state_with_events(
                session_id,
                &run.id,
                |c| {
                    c.merge_outputs(output.outputs.clone(), &output.shared_keys);
                    c.current_phase = Some(name.clone());
                    c.step_index = step_index + 1;
                    c.push_history(HistoryEntry::new(
                        Some(&name),
                        PhaseStatus::Completed.to_string(),
                    ));
                },
                &[event],
            )?;
            for row in &rows {
                self.channels.forward(row);
            }
            ctx = self.coordinator.load_state(session_id)?.0;
        }

        self.channels.publish(
            &run.id,
            session_id,
            &RunEvent::RunCompleted {
                session_id: session_id.clone(),
                run_id: run.id.clone(),
            },
        )?;
        self.coordinator.finish_run(&run.id, RunStatus::Completed, None)?;
        self.channels.release_run(&run.id);
        info!(run_id = %run.id, session_id = %session_id, "run completed");
        Ok(ctx)
    }

    /// Record the failure in history, publish the failure pair (phase-level
    /// then terminal), and close the run as failed. Observers always see
    /// `run_failed` last.
    fn fail_run(&self, run: &RunRow, phase: &str, message: &str) -> Result<(), EngineError> {
        self.coordinator.update_state(&run.session_id, |c| {
            c.push_history(HistoryEntry::new(Some(phase), PhaseStatus::Failed.to_string()));
        })?;
        self.channels.publish(
            &run.id,
            &run.session_id,
            &RunEvent::PhaseFailed {
                session_id: run.session_id.clone(),
                run_id: run.id.clone(),
                phase: phase.to_string(),
                error: message.to_string(),
            },
        )?;
        self.channels.publish(
            &run.id,
            &run.session_id,
            &RunEvent::RunFailed {
                session_id: run.session_id.clone(),
                run_id: run.id.clone(),
                error: message.to_string(),
            },
        )?;
        self.coordinator.finish_run(&run.id, RunStatus::Failed, Some(message))?;
        self.channels.release_run(&run.id);
        Ok(())
    }
}
