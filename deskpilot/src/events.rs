//! Scan of the shared error-event log written by automation modules.

use crate::config::WorkflowConfig;
use crate::utils::parse_timestamp;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Samples kept per category in the summary.
const SAMPLE_LIMIT: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventScan {
    /// Entries logged since the cutoff, of any type.
    pub total: usize,
    pub errors: Vec<Value>,
    pub warnings: Vec<Value>,
}

impl EventScan {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_samples(&self) -> Vec<Value> {
        last_n(&self.errors, SAMPLE_LIMIT)
    }

    pub fn warning_samples(&self) -> Vec<Value> {
        last_n(&self.warnings, SAMPLE_LIMIT)
    }
}

fn last_n(values: &[Value], n: usize) -> Vec<Value> {
    values[values.len().saturating_sub(n)..].to_vec()
}

/// Entries whose `ts` is at or after `since`. Unreadable files, malformed
/// lines and entries without a usable timestamp are skipped.
pub fn read_events_since(path: &Path, since: f64) -> Vec<Value> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|event| {
            event
                .get("ts")
                .and_then(parse_timestamp)
                .is_some_and(|ts| ts >= since)
        })
        .collect()
}

/// Lowercased `event` field, falling back to `type`.
pub fn event_type(event: &Value) -> String {
    ["event", "type"]
        .iter()
        .find_map(|key| event.get(*key).and_then(Value::as_str).filter(|s| !s.is_empty()))
        .unwrap_or_default()
        .to_lowercase()
}

pub fn classify(events: Vec<Value>, cfg: &WorkflowConfig) -> EventScan {
    let error_types: HashSet<String> = cfg.error_event_types.iter().map(|s| s.to_lowercase()).collect();
    let warning_types: HashSet<String> =
        cfg.warning_event_types.iter().map(|s| s.to_lowercase()).collect();

    let mut scan = EventScan {
        total: events.len(),
        ..EventScan::default()
    };
    for event in events {
        let kind = event_type(&event);
        if error_types.contains(&kind) {
            scan.errors.push(event);
        } else if warning_types.contains(&kind) {
            scan.warnings.push(event);
        }
    }
    scan
}

pub fn scan_error_events(path: &Path, since: f64, cfg: &WorkflowConfig) -> EventScan {
    classify(read_events_since(path, since), cfg)
}
