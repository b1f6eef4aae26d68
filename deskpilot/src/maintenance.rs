//! Operator tooling around a workflow run: preflight inspection of the
//! effective settings, and resetting leftover lease/pause state.

use crate::config::{AgentMode, EnvOverrides, PolicyRules};
use crate::deferred::{DeferredQueue, QueueSummary};
use crate::emergency::EmergencyStopStatus;
use crate::errors::{ControlsError, Result};
use crate::lease::Gate;
use crate::pause::{auto_unpause_allowed, PauseController};
use crate::paths::Paths;
use crate::state::{ControlState, StatePatch};
use crate::store::{age_seconds, is_stale};
use crate::utils::{file_timestamp, local_timestamp};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreflightReport {
    pub ts: String,
    pub agent_mode: AgentMode,
    pub defer_interactions_when_agent_mode: bool,
    pub stale_after_s: f64,
    pub controls_state_stale: bool,
    pub controls_state_age_s: Option<f64>,
    pub controls_state: ControlState,
    pub emergency_stop: EmergencyStopStatus,
    pub deferred_queue: QueueSummary,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

/// Snapshot of everything that decides whether a run will be live or passive.
///
/// `stale_after_s` overrides the configured threshold when positive.
pub fn preflight(
    paths: &Paths,
    rules: &PolicyRules,
    env: &EnvOverrides,
    gate: &Gate,
    queue: &DeferredQueue,
    stale_after_s: Option<f64>,
) -> PreflightReport {
    let stale_after_s = stale_after_s
        .filter(|s| *s > 0.0)
        .unwrap_or(rules.controls.stale_after_s);
    let agent_mode = AgentMode::detect(paths, env);
    let defer = rules.workflow.defer_interactions_when_agent_mode;
    let state = gate.store().read();
    let stale = is_stale(&state, stale_after_s);
    let emergency_stop = gate.emergency().status();
    let owner = state.owner();
    let paused = state.paused();

    let mut warnings = Vec::new();
    let mut suggestions = Vec::new();

    if emergency_stop.stopped {
        warnings.push(format!(
            "emergency stop is set ({}); all live automation is blocked",
            emergency_stop.reason
        ));
        suggestions.push("Clear it with `deskpilot emergency-stop clear` once it is safe.".to_string());
    }
    if paused && !stale {
        warnings.push("controls_state.paused=true (live UI automation blocked)".to_string());
        suggestions.push("For live automation run `deskpilot unpause`.".to_string());
    }
    if !owner.is_empty() && owner != rules.workflow.owner && !stale {
        warnings.push(format!(
            "controls_state.owner='{owner}' (controls owned by another workflow)"
        ));
        suggestions.push(
            "Wait for release; if truly stale use `deskpilot release-owner --force`.".to_string(),
        );
    }
    if !paused && owner.is_empty() {
        warnings.push(
            "controls are unpaused and unowned (live automation possible; consider pausing when idle)"
                .to_string(),
        );
        suggestions.push("After finishing live work run `deskpilot pause`.".to_string());
    }
    if agent_mode.active && defer {
        warnings.push(
            "agent mode on with defer enabled (interactive workflow steps will be DEFERRED)"
                .to_string(),
        );
        suggestions.push(
            "For full interactive coverage set agent_mode=false or DESKPILOT_AGENT_MODE=0."
                .to_string(),
        );
    }

    PreflightReport {
        ts: local_timestamp(),
        agent_mode,
        defer_interactions_when_agent_mode: defer,
        stale_after_s,
        controls_state_stale: stale,
        controls_state_age_s: age_seconds(&state),
        controls_state: state,
        emergency_stop,
        deferred_queue: queue.queue_summary(),
        warnings,
        suggestions,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetOptions {
    /// Clear the owner even when the state is fresh.
    pub force_clear_owner: bool,
    /// Unpause when [`auto_unpause_allowed`] says so.
    pub auto_unpause: bool,
    pub force_unpause: bool,
    /// Rewrite the current paused value to refresh `ts`.
    pub refresh: bool,
    pub dry_run: bool,
}

impl ResetOptions {
    pub fn is_noop(&self) -> bool {
        !(self.force_clear_owner || self.auto_unpause || self.force_unpause || self.refresh)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResetAction {
    ClearOwner { previous: String },
    Unpause { forced: bool },
    RefreshTimestamp { paused: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResetReport {
    pub ts: String,
    pub controls_state: ControlState,
    pub stale: bool,
    pub actions: Vec<ResetAction>,
    pub dry_run: bool,
}

/// Clears a stale (or forced) owner and lifts pauses as requested.
///
/// A stale owner is always cleared; the other actions are opt-in.
pub fn reset(
    gate: &Gate,
    pause: &PauseController,
    rules: &PolicyRules,
    options: &ResetOptions,
) -> ResetReport {
    let state = gate.store().read();
    let stale = is_stale(&state, rules.controls.stale_after_s);
    let owner = state.owner();
    let mut paused = state.paused();
    let mut actions = Vec::new();

    if (stale || options.force_clear_owner) && !owner.is_empty() {
        if !options.dry_run {
            gate.set_owner("");
        }
        actions.push(ResetAction::ClearOwner { previous: owner });
    }

    if options.force_unpause {
        if !options.dry_run {
            pause.resume("workflow_reset");
        }
        paused = false;
        actions.push(ResetAction::Unpause { forced: true });
    } else if options.auto_unpause && auto_unpause_allowed(&state, &rules.controls) {
        if !options.dry_run {
            pause.resume("workflow_reset_auto");
        }
        paused = false;
        actions.push(ResetAction::Unpause { forced: false });
    }

    if options.refresh {
        if !options.dry_run {
            gate.store().write(&StatePatch::new().paused(paused));
        }
        actions.push(ResetAction::RefreshTimestamp { paused });
    }

    info!(
        stale,
        actions = actions.len(),
        dry_run = options.dry_run,
        "Workflow state reset evaluated"
    );

    ResetReport {
        ts: local_timestamp(),
        controls_state: state,
        stale,
        actions,
        dry_run: options.dry_run,
    }
}

/// Writes `report` to `out`, or to `logs/tests/workflow_reset_<ts>.json`.
pub fn write_reset_report(paths: &Paths, report: &ResetReport, out: Option<&Path>) -> Result<PathBuf> {
    let path = match out {
        Some(p) if p.is_absolute() => p.to_path_buf(),
        Some(p) => paths.root().join(p),
        None => paths
            .tests_dir()
            .join(format!("workflow_reset_{}.json", file_timestamp())),
    };
    write_json_pretty(&path, report)?;
    Ok(path)
}

pub(crate) fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ControlsError::io(parent, e))?;
    }
    let body = serde_json::to_string_pretty(value).map_err(|e| ControlsError::json(path, e))?;
    fs::write(path, body).map_err(|e| ControlsError::io(path, e))
}
