//! Global pause flag with provenance, scheduled resume and auto-resume.

use crate::config::{ControlsConfig, UserActivityConfig};
use crate::state::{
    ControlState, StatePatch, PAUSED_AT, PAUSED_BY, PAUSED_EVENT, PAUSED_REASON, RESUME_AT,
};
use crate::store::StateStore;
use crate::utils::{local_timestamp, now_epoch};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Actor name recorded by the user-activity monitor when it pauses.
pub const USER_ACTIVITY_ACTOR: &str = "user_activity";

pub const MIN_RESUME_MINUTES: u32 = 1;
pub const MAX_RESUME_MINUTES: u32 = 120;

/// Which automatic path lifted a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeKind {
    /// `resume_at` was reached and input had been quiet long enough.
    Scheduled,
    /// No resume was scheduled and input has been idle past the threshold.
    Idle,
}

impl ResumeKind {
    pub fn reason(&self) -> &'static str {
        match self {
            ResumeKind::Scheduled => "auto_resume",
            ResumeKind::Idle => "auto_resume_idle",
        }
    }
}

impl fmt::Display for ResumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Answer to the human-facing resume prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeChoice {
    ResumeNow,
    ResumeIn { minutes: u32 },
    KeepPaused,
}

/// Something that can ask a human what to do about a pause.
///
/// Implementations may block; "keep paused" must always be reachable.
pub trait ResumePrompt: Send {
    fn ask(&mut self, state: &ControlState, default_minutes: u32) -> ResumeChoice;
}

pub fn clamp_resume_minutes(minutes: u32) -> u32 {
    minutes.clamp(MIN_RESUME_MINUTES, MAX_RESUME_MINUTES)
}

/// Pure auto-resume decision over a state snapshot.
///
/// Only pauses recorded by `actor` are eligible. A scheduled resume takes
/// precedence: while `resume_at` is set, the idle path never fires even if
/// the scheduled one is still waiting for quiet input.
pub fn evaluate_auto_resume(
    state: &ControlState,
    actor: &str,
    last_input: f64,
    now: f64,
    cfg: &UserActivityConfig,
) -> Option<ResumeKind> {
    if !state.paused() || state.paused_by() != actor {
        return None;
    }
    let quiet_for = now - last_input;
    match state.resume_at() {
        Some(resume_at) => {
            let quiet_enough = quiet_for >= cfg.resume_requires_quiet_seconds.max(0.0);
            (now >= resume_at && quiet_enough).then_some(ResumeKind::Scheduled)
        }
        None => {
            let idle_s = cfg.auto_resume_after_idle_s;
            (idle_s > 0.0 && quiet_for >= idle_s).then_some(ResumeKind::Idle)
        }
    }
}

/// Whether a workflow reset may lift a pause on its own authority.
pub fn auto_unpause_allowed(state: &ControlState, cfg: &ControlsConfig) -> bool {
    if !cfg.auto_unpause_when_idle || !state.paused() {
        return false;
    }
    if state.in_control_window() == Some(true) {
        return false;
    }
    let owner = state.owner();
    cfg.auto_unpause_owner_allowlist
        .iter()
        .any(|allowed| *allowed == owner)
}

#[derive(Clone)]
pub struct PauseController {
    store: Arc<dyn StateStore>,
}

impl PauseController {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn state(&self) -> ControlState {
        self.store.read()
    }

    /// Sets `paused` and records who paused, why and on which input event.
    pub fn pause(&self, reason: &str, paused_by: &str, event: Option<Value>) -> ControlState {
        let patch = StatePatch::new()
            .paused(true)
            .set(PAUSED_BY, paused_by)
            .set(PAUSED_REASON, reason)
            .set(PAUSED_AT, local_timestamp())
            .set(PAUSED_EVENT, event.unwrap_or_else(|| Value::Object(Map::new())));
        let written = self.store.write(&patch);
        info!(reason, paused_by, "Automation paused");
        written
    }

    /// Clears `paused`, its provenance and any scheduled resume.
    pub fn resume(&self, reason: &str) -> ControlState {
        let patch = StatePatch::new()
            .paused(false)
            .set(PAUSED_BY, "")
            .set(PAUSED_REASON, "")
            .set(PAUSED_AT, "")
            .set(PAUSED_EVENT, Value::Object(Map::new()))
            .remove(RESUME_AT);
        let written = self.store.write(&patch);
        info!(reason, "Automation resumed");
        written
    }

    /// Schedules a resume `minutes` from now (clamped to 1..=120).
    /// Returns the epoch second the resume becomes due.
    pub fn schedule_resume(&self, minutes: u32) -> f64 {
        let minutes = clamp_resume_minutes(minutes);
        let resume_at = now_epoch() + f64::from(minutes) * 60.0;
        self.schedule_resume_at(resume_at);
        debug!(minutes, resume_at, "Resume scheduled");
        resume_at
    }

    pub fn schedule_resume_at(&self, resume_at: f64) {
        self.store.write(&StatePatch::new().set(RESUME_AT, resume_at));
    }

    /// Runs one auto-resume check and applies it. Called on every monitor tick.
    pub fn auto_resume_check(
        &self,
        actor: &str,
        last_input: f64,
        now: f64,
        cfg: &UserActivityConfig,
    ) -> Option<ResumeKind> {
        let state = self.store.read();
        let kind = evaluate_auto_resume(&state, actor, last_input, now, cfg)?;
        self.resume(kind.reason());
        Some(kind)
    }

    /// Applies a prompt answer.
    pub fn apply_choice(&self, choice: ResumeChoice) {
        match choice {
            ResumeChoice::ResumeNow => {
                self.resume("user_resume");
            }
            ResumeChoice::ResumeIn { minutes } => {
                self.schedule_resume(minutes);
            }
            ResumeChoice::KeepPaused => {
                debug!("Pause kept by user");
            }
        }
    }
}
