//! Best-effort persistence of the shared control state.
//!
//! Reads and writes here never fail the caller. A lost coordination write
//! must not abort whichever process is driving real input, so I/O and parse
//! errors are logged and the store falls back to an empty document.
//!
//! Writes are a read-modify-write of the whole document and are not atomic
//! across processes: two writers racing on different fields can clobber
//! each other, last writer wins. Consumers bound the damage by re-reading
//! before side effects and by treating stale timestamps as non-binding.

use crate::state::{ControlState, StatePatch};
use crate::utils::now_epoch;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Smallest forward step applied to `ts` when the clock has not advanced.
const TS_EPSILON: f64 = 1e-6;

pub trait StateStore: Send + Sync {
    /// Parsed state, or an empty document when missing or unreadable.
    fn read(&self) -> ControlState;

    /// Applies `patch` over the current document, refreshes `ts` and
    /// persists the whole object. Returns the document as written.
    fn write(&self, patch: &StatePatch) -> ControlState;
}

/// `true` when the snapshot's `ts` is older than `max_age_s`.
///
/// Non-positive thresholds and missing or zero timestamps are never stale:
/// state is trusted unless it is proven old.
pub fn is_stale(state: &ControlState, max_age_s: f64) -> bool {
    is_stale_at(state, max_age_s, now_epoch())
}

pub fn is_stale_at(state: &ControlState, max_age_s: f64, now: f64) -> bool {
    if max_age_s <= 0.0 {
        return false;
    }
    match state.ts() {
        Some(ts) if ts > 0.0 && ts.is_finite() => (now - ts) > max_age_s,
        _ => false,
    }
}

/// Seconds since the last write, when the state carries a usable `ts`.
pub fn age_seconds(state: &ControlState) -> Option<f64> {
    state
        .ts()
        .filter(|ts| *ts > 0.0)
        .map(|ts| (now_epoch() - ts).max(0.0))
}

fn next_ts(previous: Option<f64>) -> f64 {
    let now = now_epoch();
    match previous {
        Some(prev) if prev.is_finite() && now <= prev => prev + TS_EPSILON,
        _ => now,
    }
}

/// The production store backed by `config/controls_state.json`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, state: &ControlState) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&self.path, body)
    }
}

impl StateStore for FileStateStore {
    fn read(&self) -> ControlState {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ControlState::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Unreadable controls state; treating as empty");
                return ControlState::default();
            }
        };
        if raw.trim().is_empty() {
            return ControlState::default();
        }
        match serde_json::from_str::<Map<String, Value>>(&raw) {
            Ok(map) => ControlState::from_map(map),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Malformed controls state; treating as empty");
                ControlState::default()
            }
        }
    }

    fn write(&self, patch: &StatePatch) -> ControlState {
        let mut state = self.read();
        let previous_ts = state.ts();
        state.apply(patch);
        state.set_ts(next_ts(previous_ts));
        match self.persist(&state) {
            Ok(()) => {
                debug!(
                    path = %self.path.display(),
                    keys = ?patch.keys().collect::<Vec<_>>(),
                    "Controls state written"
                );
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to write controls state");
            }
        }
        state
    }
}

/// In-memory store for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<ControlState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ControlState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Replaces the whole document without touching `ts`.
    pub fn replace(&self, state: ControlState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }
}

impl StateStore for MemoryStateStore {
    fn read(&self) -> ControlState {
        self.state
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn write(&self, patch: &StatePatch) -> ControlState {
        match self.state.lock() {
            Ok(mut guard) => {
                let previous_ts = guard.ts();
                guard.apply(patch);
                guard.set_ts(next_ts(previous_ts));
                guard.clone()
            }
            Err(_) => ControlState::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn with_ts(ts: Value) -> ControlState {
        let mut map = Map::new();
        map.insert("ts".into(), ts);
        ControlState::from_map(map)
    }

    #[test]
    fn test_staleness_thresholds() {
        let now = 1_000_000.0;
        let st = with_ts(json!(now - 30.0));
        assert!(is_stale_at(&st, 10.0, now));
        assert!(!is_stale_at(&st, 30.0, now));
        assert!(!is_stale_at(&st, 60.0, now));
        assert!(!is_stale_at(&st, 0.0, now));
        assert!(!is_stale_at(&st, -5.0, now));
    }

    #[test]
    fn test_missing_or_bad_ts_is_never_stale() {
        let now = 1_000_000.0;
        assert!(!is_stale_at(&ControlState::default(), 1.0, now));
        assert!(!is_stale_at(&with_ts(json!(0)), 1.0, now));
        assert!(!is_stale_at(&with_ts(json!("garbage")), 1.0, now));
        assert!(!is_stale_at(&with_ts(json!(-3.0)), 1.0, now));
    }

    #[test]
    fn test_file_store_missing_and_malformed_read_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("controls_state.json");
        let store = FileStateStore::new(&path);
        assert!(store.read().is_empty());

        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();
        assert!(store.read().is_empty());

        fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(store.read().is_empty());
    }

    #[test]
    fn test_file_store_round_trip_merges_and_advances_ts() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path().join("nested/dir/controls_state.json"));

        let first = store.write(&StatePatch::new().owner("workflow_x").paused(false));
        let second = store.write(&StatePatch::new().set("paused_reason", "manual"));

        let read_back = store.read();
        assert_eq!(read_back.owner(), "workflow_x");
        assert!(!read_back.paused());
        assert_eq!(read_back.paused_reason(), "manual");
        assert!(second.ts().unwrap() > first.ts().unwrap());
        assert_eq!(read_back.ts(), second.ts());
    }

    #[test]
    fn test_file_store_preserves_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("controls_state.json");
        fs::write(&path, r#"{"custom_tool_field": {"a": 1}, "owner": "x"}"#).unwrap();
        let store = FileStateStore::new(&path);
        store.write(&StatePatch::new().owner(""));
        let st = store.read();
        assert_eq!(st.get("custom_tool_field"), Some(&json!({"a": 1})));
        assert_eq!(st.owner(), "");
    }

    #[test]
    fn test_write_into_unwritable_location_does_not_panic() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "file, not a directory").unwrap();
        let store = FileStateStore::new(blocker.join("controls_state.json"));
        let written = store.write(&StatePatch::new().paused(true));
        assert!(written.paused());
        assert!(store.read().is_empty());
    }
}
