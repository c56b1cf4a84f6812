use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use skein_core::approval::Resolution;
use skein_core::context::WorkflowContext;
use skein_core::events::RunEvent;
use skein_core::ids::{RunId, SessionId};

use crate::approval::ApprovalGate;
use crate::channel::ChannelManager;
use crate::error::EngineError;

/// Disposition of a phase as recorded in the context history. Phases that
/// never ran leave no entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for PhaseStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown phase status: {other}")),
        }
    }
}

/// What a phase hands back on success.
#[derive(Clone, Debug, Default)]
pub struct PhaseOutput {
    pub outputs: BTreeMap<String, Value>,
    /// Output keys designated to carry forward across runs.
    pub shared_keys: Vec<String>,
}

impl PhaseOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    pub fn shared(mut self, key: impl Into<String>) -> Self {
        self.shared_keys.push(key.into());
        self
    }
}

/// Collaborators a phase body may use while executing. External systems the
/// phase talks to stay behind this seam.
pub struct PhaseServices {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub channels: Arc<ChannelManager>,
    pub gate: Arc<ApprovalGate>,
}

impl PhaseServices {
    /// Stream an incremental output chunk to observers.
    pub fn emit_chunk(&self, phase: &str, chunk: &str) -> Result<(), EngineError> {
        self.channels.publish(
            &self.run_id,
            &self.session_id,
            &RunEvent::OutputChunk {
                session_id: self.session_id.clone(),
                run_id: self.run_id.clone(),
                phase: phase.to_string(),
                chunk: chunk.to_string(),
            },
        )?;
        Ok(())
    }

    /// Report accumulated run cost to observers.
    pub fn emit_cost(&self, total_cost_cents: f64) -> Result<(), EngineError> {
        self.channels.publish(
            &self.run_id,
            &self.session_id,
            &RunEvent::CostUpdate {
                session_id: self.session_id.clone(),
                run_id: self.run_id.clone(),
                total_cost_cents,
            },
        )?;
        Ok(())
    }

    /// Open an approval checkpoint and park until it resolves or its stored
    /// deadline passes. `timeout` bounds the wait itself; if it fires while
    /// the request is still live the checkpoint stays pending and the phase
    /// gets `ApprovalTimeout`.
    pub async fn request_approval(
        &self,
        checkpoint: &str,
        snapshot: Value,
        options: &[String],
        deadline: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Resolution, EngineError> {
        let row = self
            .gate
            .request(&self.run_id, checkpoint, snapshot, options, deadline)?;
        self.gate.await_resolution(&row.id, timeout).await
    }
}

/// One step in a workflow. Implementations declare their input keys up
/// front and return their outputs; the executor owns merging, persistence,
/// and event publication.
#[async_trait]
pub trait Phase: Send + Sync {
    fn name(&self) -> &str;

    /// Context keys this phase reads. Validated before execution.
    fn required_inputs(&self) -> &[&'static str] {
        &[]
    }

    /// Evaluated against the accumulated context at the phase boundary.
    fn should_skip(&self, _ctx: &WorkflowContext) -> bool {
        false
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        services: &PhaseServices,
    ) -> Result<PhaseOutput, EngineError>;
}
