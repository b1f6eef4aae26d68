//! Emergency stop flag, independent of the shared control state.

use crate::errors::{ControlsError, Result};
use crate::utils::{now_epoch, parse_bool, parse_timestamp, value_as_bool, value_as_f64};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Contents of `config/emergency_stop.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmergencyStopStatus {
    #[serde(default)]
    pub stopped: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub timestamp: f64,
}

impl EmergencyStopStatus {
    /// Reads a hand-edited flag document. Only `stopped` decides the flag;
    /// `reason` and `timestamp` are kept when they have a usable shape.
    pub fn from_value(value: &Value) -> Self {
        let stopped = match value.get("stopped") {
            Some(Value::String(s)) => parse_bool(s).unwrap_or(false),
            Some(other) => value_as_bool(other),
            None => false,
        };
        let reason = match value.get("reason") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let timestamp = value
            .get("timestamp")
            .and_then(|ts| value_as_f64(ts).or_else(|| parse_timestamp(ts)))
            .unwrap_or(0.0);
        Self {
            stopped,
            reason,
            timestamp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmergencyStop {
    path: Option<PathBuf>,
}

impl EmergencyStop {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// A flag that is never set; for embedding without a config directory.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Current flag contents. Missing or unreadable files read as "not stopped".
    pub fn status(&self) -> EmergencyStopStatus {
        let Some(path) = &self.path else {
            return EmergencyStopStatus::default();
        };
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return EmergencyStopStatus::default(),
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => EmergencyStopStatus::from_value(&value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed emergency stop file ignored");
                EmergencyStopStatus::default()
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.status().stopped
    }

    pub fn set(&self, stopped: bool, reason: &str) -> Result<EmergencyStopStatus> {
        let path = self.path.as_ref().ok_or_else(|| {
            ControlsError::InvalidArgument("emergency stop has no backing file".to_string())
        })?;
        let status = EmergencyStopStatus {
            stopped,
            reason: reason.to_string(),
            timestamp: now_epoch(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ControlsError::io(parent, e))?;
        }
        let body =
            serde_json::to_string_pretty(&status).map_err(|e| ControlsError::json(path, e))?;
        fs::write(path, body).map_err(|e| ControlsError::io(path, e))?;
        debug!(stopped, reason, "Emergency stop updated");
        Ok(status)
    }
}
