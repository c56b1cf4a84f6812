use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One entry in a session's ordered log history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: String,
    pub phase: Option<String>,
    pub text: String,
}

impl HistoryEntry {
    pub fn new(phase: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            at: Utc::now().to_rfc3339(),
            phase: phase.map(str::to_string),
            text: text.into(),
        }
    }
}

/// Mutable payload threaded through a phase sequence.
///
/// Phases receive the entire accumulated context but declare up front which
/// keys they read; only a phase's self-declared outputs are guaranteed
/// visible to later phases. `shared_keys` records the subset of outputs
/// explicitly designated to carry forward across runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub history: Vec<HistoryEntry>,
    pub variables: BTreeMap<String, Value>,
    pub shared_keys: Vec<String>,
    pub current_phase: Option<String>,
    pub step_index: u32,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.variables.contains_key(key)
    }

    /// Truthiness check for skip predicates: missing, `false`, and `null`
    /// are all falsy.
    pub fn flag(&self, key: &str) -> bool {
        match self.variables.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Null) | None => false,
            Some(_) => true,
        }
    }

    /// Which of `required` are absent from the context.
    pub fn missing_keys(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|k| !self.variables.contains_key(**k))
            .map(|k| (*k).to_string())
            .collect()
    }

    /// Merge a phase's outputs, recording which keys it designated as shared.
    pub fn merge_outputs(&mut self, outputs: BTreeMap<String, Value>, shared: &[String]) {
        for (k, v) in outputs {
            self.variables.insert(k, v);
        }
        for key in shared {
            if !self.shared_keys.contains(key) {
                self.shared_keys.push(key.clone());
            }
        }
    }

    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    /// Most recent history entry, if any. Callers must handle the empty
    /// case; there is no unconditional last-element access anywhere.
    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_contains() {
        let mut ctx = WorkflowContext::new();
        assert!(!ctx.contains("plan"));
        ctx.set("plan", json!({"steps": 3}));
        assert!(ctx.contains("plan"));
        assert_eq!(ctx.get("plan").unwrap()["steps"], 3);
    }

    #[test]
    fn missing_keys_lists_absent_only() {
        let mut ctx = WorkflowContext::new();
        ctx.set("a", json!(1));
        let missing = ctx.missing_keys(&["a", "b", "c"]);
        assert_eq!(missing, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn flag_truthiness() {
        let mut ctx = WorkflowContext::new();
        assert!(!ctx.flag("absent"));
        ctx.set("off", json!(false));
        assert!(!ctx.flag("off"));
        ctx.set("nil", json!(null));
        assert!(!ctx.flag("nil"));
        ctx.set("on", json!(true));
        assert!(ctx.flag("on"));
        ctx.set("value", json!("anything"));
        assert!(ctx.flag("value"));
    }

    #[test]
    fn merge_outputs_records_shared_keys_once() {
        let mut ctx = WorkflowContext::new();
        let mut outputs = BTreeMap::new();
        outputs.insert("report".to_string(), json!("..."));
        ctx.merge_outputs(outputs.clone(), &["report".to_string()]);
        ctx.merge_outputs(outputs, &["report".to_string()]);
        assert_eq!(ctx.shared_keys, vec!["report".to_string()]);
    }

    #[test]
    fn last_entry_on_empty_history_is_none() {
        let ctx = WorkflowContext::new();
        assert!(ctx.last_entry().is_none());
    }

    #[test]
    fn last_entry_returns_most_recent() {
        let mut ctx = WorkflowContext::new();
        ctx.push_history(HistoryEntry::new(Some("a"), "first"));
        ctx.push_history(HistoryEntry::new(Some("b"), "second"));
        assert_eq!(ctx.last_entry().unwrap().text, "second");
    }

    #[test]
    fn serde_roundtrip() {
        let mut ctx = WorkflowContext::new();
        ctx.set("k", json!([1, 2]));
        ctx.current_phase = Some("build".into());
        ctx.step_index = 2;
        let json = serde_json::to_string(&ctx).unwrap();
        let parsed: WorkflowContext = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ctx);
    }
}
