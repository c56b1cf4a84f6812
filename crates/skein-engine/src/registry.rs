use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::phase::Phase;

/// Maps workflow mode names to their phase sequences.
#[derive(Default)]
pub struct WorkflowRegistry {
    modes: RwLock<HashMap<String, Vec<Arc<dyn Phase>>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, mode: impl Into<String>, phases: Vec<Arc<dyn Phase>>) {
        self.modes.write().insert(mode.into(), phases);
    }

    pub fn get(&self, mode: &str) -> Option<Vec<Arc<dyn Phase>>> {
        self.modes.read().get(mode).cloned()
    }

    pub fn modes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modes.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{PhaseOutput, PhaseServices};
    use async_trait::async_trait;
    use skein_core::context::WorkflowContext;

    struct Noop(&'static str);

    #[async_trait]
    impl Phase for Noop {
        fn name(&self) -> &str {
            self.0
        }
        async fn execute(
            &self,
            _ctx: &WorkflowContext,
            _services: &PhaseServices,
        ) -> Result<PhaseOutput, crate::error::EngineError> {
            Ok(PhaseOutput::new())
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = WorkflowRegistry::new();
        registry.register("review", vec![Arc::new(Noop("analyze")), Arc::new(Noop("report"))]);

        let phases = registry.get("review").unwrap();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].name(), "analyze");
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.modes(), vec!["review".to_string()]);
    }
}
