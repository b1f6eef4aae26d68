use crate::error::{MonitorError, Result};
use deskpilot::utils::local_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Raw input as delivered by the global listener.
#[derive(Debug, Clone, PartialEq)]
pub enum RawInput {
    Key { esc: bool, name: String },
    MouseMove { x: f64, y: f64 },
}

impl RawInput {
    pub fn key(name: impl Into<String>) -> Self {
        RawInput::Key {
            esc: false,
            name: name.into(),
        }
    }

    pub fn esc() -> Self {
        RawInput::Key {
            esc: true,
            name: "esc".to_string(),
        }
    }
}

/// Input that survived filtering and may trigger a pause.
///
/// Serialized into `paused_event` and the activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    Key { key: String },
    /// Accumulated pointer travel crossed the threshold; carries the last delta.
    Mouse { distance_px: f64 },
}

impl InputEvent {
    pub fn is_esc(&self) -> bool {
        matches!(self, InputEvent::Key { key } if key == "esc")
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One line of `logs/actions/user_activity_events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub ts: String,
    pub event: Value,
    pub paused: bool,
}

impl ActivityLogEntry {
    pub fn paused(event: &InputEvent) -> Self {
        Self {
            ts: local_timestamp(),
            event: event.to_value(),
            paused: true,
        }
    }

    /// Entry for an automatic resume; `kind` is `auto_resume_at` or `auto_resume_idle`.
    pub fn resumed(kind: &str) -> Self {
        Self {
            ts: local_timestamp(),
            event: serde_json::json!({ "type": kind }),
            paused: false,
        }
    }
}

/// Append-only JSONL log of monitor transitions.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    path: PathBuf,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &ActivityLogEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| MonitorError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| MonitorError::Io {
                path: self.path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes()).map_err(|source| MonitorError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Entries that parse, oldest first. Missing file reads as empty.
    pub fn read_all(&self) -> Vec<ActivityLogEntry> {
        fs::read_to_string(&self.path)
            .map(|raw| {
                raw.lines()
                    .filter_map(|line| serde_json::from_str(line.trim()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_event_wire_shape() {
        let esc = InputEvent::Key { key: "esc".into() };
        assert!(esc.is_esc());
        assert_eq!(esc.to_value(), serde_json::json!({"type": "key", "key": "esc"}));
        let mouse = InputEvent::Mouse { distance_px: 12.5 };
        assert!(!mouse.is_esc());
        assert_eq!(mouse.to_value()["type"], "mouse");
    }

    #[test]
    fn test_log_appends_lines() {
        let dir = TempDir::new().unwrap();
        let log = ActivityLog::new(dir.path().join("logs/actions/user_activity_events.jsonl"));
        assert!(log.read_all().is_empty());
        log.append(&ActivityLogEntry::paused(&InputEvent::Key { key: "a".into() }))
            .unwrap();
        log.append(&ActivityLogEntry::resumed("auto_resume_idle")).unwrap();
        let entries = log.read_all();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].paused);
        assert_eq!(entries[1].event["type"], "auto_resume_idle");
    }
}
