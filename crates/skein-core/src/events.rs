use serde::{Deserialize, Serialize};

use crate::approval::Decision;
use crate::ids::{ApprovalId, RunId, SessionId};

/// Progress events emitted while a workflow run executes.
///
/// Every producer goes through one publish path: the event is appended to the
/// durable per-run log first, then pushed best-effort to live observers.
/// These are the internal typed events; the wire shape is their serde form.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    #[serde(rename = "run_started")]
    RunStarted {
        session_id: SessionId,
        run_id: RunId,
        mode: String,
    },

    #[serde(rename = "phase_started")]
    PhaseStarted {
        session_id: SessionId,
        run_id: RunId,
        phase: String,
        step_index: u32,
    },

    #[serde(rename = "phase_completed")]
    PhaseCompleted {
        session_id: SessionId,
        run_id: RunId,
        phase: String,
        step_index: u32,
    },

    #[serde(rename = "phase_skipped")]
    PhaseSkipped {
        session_id: SessionId,
        run_id: RunId,
        phase: String,
        step_index: u32,
    },

    #[serde(rename = "phase_failed")]
    PhaseFailed {
        session_id: SessionId,
        run_id: RunId,
        phase: String,
        error: String,
    },

    #[serde(rename = "output_chunk")]
    OutputChunk {
        session_id: SessionId,
        run_id: RunId,
        phase: String,
        chunk: String,
    },

    #[serde(rename = "cost_update")]
    CostUpdate {
        session_id: SessionId,
        run_id: RunId,
        total_cost_cents: f64,
    },

    #[serde(rename = "approval_requested")]
    ApprovalRequested {
        session_id: SessionId,
        run_id: RunId,
        approval_id: ApprovalId,
        checkpoint: String,
    },

    #[serde(rename = "approval_resolved")]
    ApprovalResolved {
        session_id: SessionId,
        run_id: RunId,
        approval_id: ApprovalId,
        decision: Decision,
    },

    #[serde(rename = "session_suspended")]
    SessionSuspended {
        session_id: SessionId,
        run_id: RunId,
    },

    #[serde(rename = "session_resumed")]
    SessionResumed {
        session_id: SessionId,
        run_id: RunId,
    },

    #[serde(rename = "run_completed")]
    RunCompleted {
        session_id: SessionId,
        run_id: RunId,
    },

    /// Terminal failure marker. All live observers receive this before the
    /// run is closed out.
    #[serde(rename = "run_failed")]
    RunFailed {
        session_id: SessionId,
        run_id: RunId,
        error: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::PhaseStarted { run_id, .. }
            | Self::PhaseCompleted { run_id, .. }
            | Self::PhaseSkipped { run_id, .. }
            | Self::PhaseFailed { run_id, .. }
            | Self::OutputChunk { run_id, .. }
            | Self::CostUpdate { run_id, .. }
            | Self::ApprovalRequested { run_id, .. }
            | Self::ApprovalResolved { run_id, .. }
            | Self::SessionSuspended { run_id, .. }
            | Self::SessionResumed { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. } => run_id,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::RunStarted { session_id, .. }
            | Self::PhaseStarted { session_id, .. }
            | Self::PhaseCompleted { session_id, .. }
            | Self::PhaseSkipped { session_id, .. }
            | Self::PhaseFailed { session_id, .. }
            | Self::OutputChunk { session_id, .. }
            | Self::CostUpdate { session_id, .. }
            | Self::ApprovalRequested { session_id, .. }
            | Self::ApprovalResolved { session_id, .. }
            | Self::SessionSuspended { session_id, .. }
            | Self::SessionResumed { session_id, .. }
            | Self::RunCompleted { session_id, .. }
            | Self::RunFailed { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::PhaseStarted { .. } => "phase_started",
            Self::PhaseCompleted { .. } => "phase_completed",
            Self::PhaseSkipped { .. } => "phase_skipped",
            Self::PhaseFailed { .. } => "phase_failed",
            Self::OutputChunk { .. } => "output_chunk",
            Self::CostUpdate { .. } => "cost_update",
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::ApprovalResolved { .. } => "approval_resolved",
            Self::SessionSuspended { .. } => "session_suspended",
            Self::SessionResumed { .. } => "session_resumed",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = RunEvent::PhaseStarted {
            session_id: SessionId::new(),
            run_id: RunId::new(),
            phase: "analyze".into(),
            step_index: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "phase_started");
        assert_eq!(json["phase"], "analyze");
    }

    #[test]
    fn run_id_accessor_covers_all_variants() {
        let run_id = RunId::new();
        let event = RunEvent::RunFailed {
            session_id: SessionId::new(),
            run_id: run_id.clone(),
            error: "boom".into(),
        };
        assert_eq!(event.run_id(), &run_id);
        assert_eq!(event.event_type(), "run_failed");
    }

    #[test]
    fn approval_event_roundtrip() {
        let event = RunEvent::ApprovalResolved {
            session_id: SessionId::new(),
            run_id: RunId::new(),
            approval_id: ApprovalId::new(),
            decision: Decision::Approved,
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: RunEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "approval_resolved");
    }
}
