//! Built-in workflow modes registered by the server binary.
//!
//! `checkpoint` is the reference three-phase workflow: stage the inputs,
//! hold at a human approval gate, then finalize. Deployments add their own
//! modes by registering `Phase` implementations before server start.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use skein_core::context::WorkflowContext;
use skein_engine::error::EngineError;
use skein_engine::phase::{Phase, PhaseOutput, PhaseServices};
use skein_engine::registry::WorkflowRegistry;

const REVIEW_DEADLINE_MINS: i64 = 15;

/// Stages the run: records when it started and what it was given.
struct PreparePhase;

#[async_trait]
impl Phase for PreparePhase {
    fn name(&self) -> &str {
        "prepare"
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        services: &PhaseServices,
    ) -> Result<PhaseOutput, EngineError> {
        services.emit_chunk("prepare", "staging inputs")?;
        Ok(PhaseOutput::new()
            .with("prepared_at", json!(Utc::now().to_rfc3339()))
            .with("input_count", json!(ctx.variables.len())))
    }
}

/// Holds the run at a human approval gate. A rejection (explicit or by
/// deadline default) fails the phase and therefore the run.
struct ReviewPhase {
    /// Optional: skip the gate entirely when this context flag is set.
    skip_flag: &'static str,
}

#[async_trait]
impl Phase for ReviewPhase {
    fn name(&self) -> &str {
        "review"
    }

    fn required_inputs(&self) -> &[&'static str] {
        &["prepared_at"]
    }

    fn should_skip(&self, ctx: &WorkflowContext) -> bool {
        ctx.flag(self.skip_flag)
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        services: &PhaseServices,
    ) -> Result<PhaseOutput, EngineError> {
        let deadline = Utc::now() + ChronoDuration::minutes(REVIEW_DEADLINE_MINS);
        // The wait outlives the deadline so expiry, not the wait, decides.
        let resolution = services
            .request_approval(
                "review",
                json!({ "variables": ctx.variables }),
                &["approved".to_string(), "rejected".to_string()],
                deadline,
                Duration::from_secs((REVIEW_DEADLINE_MINS * 60) as u64 + 5),
            )
            .await?;

        if !resolution.decision.is_approved() {
            return Err(EngineError::PhaseFailed {
                phase: "review".into(),
                message: format!("review declined: {}", resolution.decision),
            });
        }
        Ok(PhaseOutput::new()
            .with("review_feedback", json!(resolution.feedback))
            .shared("review_feedback"))
    }
}

/// Closes the run out with a summary of what accumulated.
struct FinalizePhase;

#[async_trait]
impl Phase for FinalizePhase {
    fn name(&self) -> &str {
        "finalize"
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        services: &PhaseServices,
    ) -> Result<PhaseOutput, EngineError> {
        services.emit_chunk("finalize", "closing out run")?;
        Ok(PhaseOutput::new()
            .with("finalized_at", json!(Utc::now().to_rfc3339()))
            .with("variable_count", json!(ctx.variables.len())))
    }
}

/// Register the built-in modes.
pub fn register_builtin(registry: &WorkflowRegistry) {
    registry.register(
        "checkpoint",
        vec![
            Arc::new(PreparePhase),
            Arc::new(ReviewPhase {
                skip_flag: "skip_review",
            }),
            Arc::new(FinalizePhase),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_modes_are_registered() {
        let registry = WorkflowRegistry::new();
        register_builtin(&registry);
        let phases = registry.get("checkpoint").unwrap();
        assert_eq!(phases.len(), 3);
        assert_eq!(phases[0].name(), "prepare");
        assert_eq!(phases[1].name(), "review");
        assert_eq!(phases[2].name(), "finalize");
    }

    #[test]
    fn review_skips_on_flag() {
        let registry = WorkflowRegistry::new();
        register_builtin(&registry);
        let phases = registry.get("checkpoint").unwrap();

        let mut ctx = WorkflowContext::new();
        assert!(!phases[1].should_skip(&ctx));
        ctx.set("skip_review", json!(true));
        assert!(phases[1].should_skip(&ctx));
    }
}
