//! The shared control-state document and partial updates to it.
//!
//! The document is kept as a loose JSON object rather than a closed struct:
//! several independent tools write to it and fields this crate does not know
//! about must survive a read-modify-write cycle.

use crate::utils::{value_as_bool, value_as_f64};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const OWNER: &str = "owner";
pub const IN_USE: &str = "in_use";
pub const PAUSED: &str = "paused";
pub const PAUSED_BY: &str = "paused_by";
pub const PAUSED_REASON: &str = "paused_reason";
pub const PAUSED_AT: &str = "paused_at";
pub const PAUSED_EVENT: &str = "paused_event";
pub const RESUME_AT: &str = "resume_at";
pub const IN_CONTROL_WINDOW: &str = "in_control_window";
pub const CONTROL_REMAINING_S: &str = "control_remaining_s";
pub const TS: &str = "ts";

/// Snapshot of `controls_state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlState {
    fields: Map<String, Value>,
}

impl ControlState {
    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.fields
    }

    /// Current lease holder; empty when unowned.
    pub fn owner(&self) -> String {
        match self.fields.get(OWNER) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    pub fn paused(&self) -> bool {
        self.fields.get(PAUSED).map(value_as_bool).unwrap_or(false)
    }

    pub fn paused_by(&self) -> String {
        self.str_field(PAUSED_BY)
    }

    pub fn paused_reason(&self) -> String {
        self.str_field(PAUSED_REASON)
    }

    /// Epoch seconds of the last write, if present and numeric.
    pub fn ts(&self) -> Option<f64> {
        self.fields.get(TS).and_then(value_as_f64)
    }

    /// Scheduled resume time; `0` and missing both mean "not scheduled".
    pub fn resume_at(&self) -> Option<f64> {
        self.fields
            .get(RESUME_AT)
            .and_then(value_as_f64)
            .filter(|t| *t > 0.0)
    }

    /// `None` when the field has never been written.
    pub fn in_control_window(&self) -> Option<bool> {
        self.fields.get(IN_CONTROL_WINDOW).map(value_as_bool)
    }

    pub fn control_remaining_s(&self) -> Option<f64> {
        self.fields.get(CONTROL_REMAINING_S).and_then(value_as_f64)
    }

    fn str_field(&self, key: &str) -> String {
        self.fields
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    /// Shallow-merges `patch` into this document.
    pub(crate) fn apply(&mut self, patch: &StatePatch) {
        for (key, change) in &patch.changes {
            match change {
                Some(value) => {
                    self.fields.insert(key.clone(), value.clone());
                }
                None => {
                    self.fields.remove(key);
                }
            }
        }
    }

    pub(crate) fn set_ts(&mut self, ts: f64) {
        self.fields.insert(TS.to_string(), Value::from(ts));
    }
}

/// A partial update: each key is either replaced or removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    changes: Vec<(String, Option<Value>)>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changes.push((key.into(), Some(value.into())));
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.changes.push((key.into(), None));
        self
    }

    /// Sets `owner` and keeps the derived `in_use` flag consistent with it.
    pub fn owner(self, owner: &str) -> Self {
        self.set(OWNER, owner).set(IN_USE, !owner.is_empty())
    }

    pub fn paused(self, paused: bool) -> Self {
        self.set(PAUSED, paused)
    }

    pub fn control_window(self, in_control: bool, remaining_s: f64) -> Self {
        self.set(IN_CONTROL_WINDOW, in_control)
            .set(CONTROL_REMAINING_S, remaining_s)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|(k, _)| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> ControlState {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_tolerant_accessors() {
        let st = state(json!({
            "owner": "workflow_x",
            "paused": " TRUE ",
            "ts": "1700000000.5",
            "resume_at": 0,
        }));
        assert_eq!(st.owner(), "workflow_x");
        assert!(st.paused());
        assert_eq!(st.ts(), Some(1_700_000_000.5));
        assert_eq!(st.resume_at(), None);
        assert_eq!(st.in_control_window(), None);
    }

    #[test]
    fn test_patch_sets_and_removes() {
        let mut st = state(json!({"resume_at": 10.0, "custom": 1}));
        let patch = StatePatch::new().owner("agent").remove(RESUME_AT);
        st.apply(&patch);
        assert_eq!(st.owner(), "agent");
        assert_eq!(st.get(IN_USE), Some(&json!(true)));
        assert!(st.get(RESUME_AT).is_none());
        assert_eq!(st.get("custom"), Some(&json!(1)));
    }

    #[test]
    fn test_release_clears_in_use() {
        let mut st = ControlState::default();
        st.apply(&StatePatch::new().owner("a"));
        st.apply(&StatePatch::new().owner(""));
        assert_eq!(st.owner(), "");
        assert_eq!(st.get(IN_USE), Some(&json!(false)));
    }
}
