//! The user-activity interrupt state machine.
//!
//! Input only ever moves the monitor from `Idle` to `Paused`. The way back
//! is through the pause controller: a prompt answer or an auto-resume
//! check on a quiet tick. Input seen while paused only refreshes the
//! quiet timer.

use crate::dpi::cm_to_px;
use crate::events::{ActivityLog, ActivityLogEntry, InputEvent, RawInput};
use deskpilot::config::UserActivityConfig;
use deskpilot::pause::USER_ACTIVITY_ACTOR;
use deskpilot::{ControlState, PauseController, ResumeChoice, ResumeKind, ResumePrompt};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityPolicy {
    pub esc_only: bool,
    pub any_key_pauses: bool,
    pub esc_only_when_owner_active: bool,
    pub mouse_px_threshold: f64,
}

impl ActivityPolicy {
    /// `force_esc_only` comes from the command line and can only tighten
    /// the configured policy.
    pub fn new(cfg: &UserActivityConfig, force_esc_only: bool, dpi: f64) -> Self {
        let esc_only = cfg.esc_only || force_esc_only;
        Self {
            esc_only,
            any_key_pauses: cfg.any_key_pauses && !esc_only,
            esc_only_when_owner_active: cfg.esc_only_when_owner_active,
            mouse_px_threshold: cm_to_px(cfg.mouse_cm_threshold, dpi),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    OwnerActive,
    InControlWindow,
    AlreadyPaused,
    KeysDisabled,
    EscOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pause,
    Ignore(IgnoreReason),
}

/// Decides whether `event` should pause automation given the shared state.
pub fn evaluate(event: &InputEvent, state: &ControlState, policy: &ActivityPolicy) -> Verdict {
    let is_esc = event.is_esc();
    if !is_esc && policy.esc_only_when_owner_active && !state.owner().is_empty() {
        return Verdict::Ignore(IgnoreReason::OwnerActive);
    }
    if !is_esc && state.in_control_window() == Some(true) {
        return Verdict::Ignore(IgnoreReason::InControlWindow);
    }
    if state.paused() {
        return Verdict::Ignore(IgnoreReason::AlreadyPaused);
    }
    match event {
        InputEvent::Key { .. } if !is_esc && !policy.any_key_pauses => {
            Verdict::Ignore(IgnoreReason::KeysDisabled)
        }
        InputEvent::Mouse { .. } if policy.esc_only => Verdict::Ignore(IgnoreReason::EscOnly),
        _ => Verdict::Pause,
    }
}

/// Running total of pointer travel since the last threshold crossing.
#[derive(Debug, Clone, PartialEq)]
pub struct MouseAccumulator {
    last: Option<(f64, f64)>,
    travelled: f64,
    threshold_px: f64,
}

impl MouseAccumulator {
    pub fn new(threshold_px: f64) -> Self {
        Self {
            last: None,
            travelled: 0.0,
            threshold_px,
        }
    }

    /// Feeds one cursor position. Returns the latest step distance when the
    /// total reaches the threshold, and starts counting from zero again.
    pub fn observe(&mut self, x: f64, y: f64) -> Option<f64> {
        let (lx, ly) = self.last.replace((x, y))?;
        let step = (x - lx).hypot(y - ly);
        self.travelled += step;
        if self.travelled >= self.threshold_px {
            self.travelled = 0.0;
            Some(step)
        } else {
            None
        }
    }

    /// Drops the last known position so the next sample starts a new trail.
    pub fn forget_position(&mut self) {
        self.last = None;
    }

    pub fn travelled(&self) -> f64 {
        self.travelled
    }

    pub fn set_threshold(&mut self, threshold_px: f64) {
        self.threshold_px = threshold_px;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    /// Automation is paused and this monitor caused it.
    Paused,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Paused(InputEvent),
    Resumed(ResumeKind),
}

fn resume_log_kind(kind: ResumeKind) -> &'static str {
    match kind {
        ResumeKind::Scheduled => "auto_resume_at",
        ResumeKind::Idle => "auto_resume_idle",
    }
}

pub struct ActivityMonitor {
    pause: PauseController,
    config: UserActivityConfig,
    force_esc_only: bool,
    dpi: f64,
    policy: ActivityPolicy,
    mouse: MouseAccumulator,
    log: ActivityLog,
    last_input: f64,
    state: MonitorState,
}

impl ActivityMonitor {
    pub fn new(
        pause: PauseController,
        config: UserActivityConfig,
        dpi: f64,
        force_esc_only: bool,
        log: ActivityLog,
        now: f64,
    ) -> Self {
        let policy = ActivityPolicy::new(&config, force_esc_only, dpi);
        info!(
            dpi,
            mouse_px_threshold = policy.mouse_px_threshold,
            esc_only = policy.esc_only,
            any_key_pauses = policy.any_key_pauses,
            "Activity monitor configured"
        );
        Self {
            mouse: MouseAccumulator::new(policy.mouse_px_threshold),
            pause,
            config,
            force_esc_only,
            dpi,
            policy,
            log,
            last_input: now,
            state: MonitorState::Idle,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn policy(&self) -> &ActivityPolicy {
        &self.policy
    }

    pub fn config(&self) -> &UserActivityConfig {
        &self.config
    }

    pub fn last_input(&self) -> f64 {
        self.last_input
    }

    /// Applies edited settings without losing the current mouse trail.
    pub fn update_config(&mut self, config: UserActivityConfig) {
        if config == self.config {
            return;
        }
        self.policy = ActivityPolicy::new(&config, self.force_esc_only, self.dpi);
        self.mouse.set_threshold(self.policy.mouse_px_threshold);
        self.config = config;
        debug!(policy = ?self.policy, "Activity policy reloaded");
    }

    /// Filters raw input down to events worth evaluating.
    pub fn observe(&mut self, raw: RawInput) -> Option<InputEvent> {
        match raw {
            RawInput::Key { esc: true, .. } => Some(InputEvent::Key {
                key: "esc".to_string(),
            }),
            RawInput::Key { name, .. } => Some(InputEvent::Key { key: name }),
            RawInput::MouseMove { .. } if self.policy.esc_only => {
                self.mouse.forget_position();
                None
            }
            RawInput::MouseMove { x, y } => self
                .mouse
                .observe(x, y)
                .map(|distance_px| InputEvent::Mouse { distance_px }),
        }
    }

    /// Refreshes the quiet timer and pauses automation if policy says so.
    pub fn handle_event(&mut self, event: InputEvent, now: f64) -> Option<Transition> {
        self.last_input = now;
        let state = self.pause.state();
        match evaluate(&event, &state, &self.policy) {
            Verdict::Ignore(reason) => {
                debug!(?event, ?reason, "Input ignored");
                None
            }
            Verdict::Pause => {
                self.pause
                    .pause(USER_ACTIVITY_ACTOR, USER_ACTIVITY_ACTOR, Some(event.to_value()));
                if let Err(e) = self.log.append(&ActivityLogEntry::paused(&event)) {
                    warn!("Failed to log activity event: {e}");
                }
                self.state = MonitorState::Paused;
                info!(?event, "User activity detected; automation paused");
                Some(Transition::Paused(event))
            }
        }
    }

    pub fn handle(&mut self, raw: RawInput, now: f64) -> Option<Transition> {
        let event = self.observe(raw)?;
        self.handle_event(event, now)
    }

    /// Quiet-period housekeeping: runs the auto-resume check and resyncs
    /// the local state with the shared document.
    pub fn tick(&mut self, now: f64) -> Option<Transition> {
        if let Some(kind) =
            self.pause
                .auto_resume_check(USER_ACTIVITY_ACTOR, self.last_input, now, &self.config)
        {
            if let Err(e) = self.log.append(&ActivityLogEntry::resumed(resume_log_kind(kind))) {
                warn!("Failed to log activity event: {e}");
            }
            self.state = MonitorState::Idle;
            return Some(Transition::Resumed(kind));
        }
        let state = self.pause.state();
        self.state = if state.paused() && state.paused_by() == USER_ACTIVITY_ACTOR {
            MonitorState::Paused
        } else {
            MonitorState::Idle
        };
        None
    }

    /// Asks `prompt` what to do about the current pause and applies it.
    pub fn prompt_resume(&mut self, prompt: &mut dyn ResumePrompt) -> ResumeChoice {
        let state = self.pause.state();
        let choice = prompt.ask(&state, self.config.popup_default_minutes);
        self.pause.apply_choice(choice);
        if choice == ResumeChoice::ResumeNow {
            self.state = MonitorState::Idle;
        }
        choice
    }
}
