//! Typed view of `config/policy_rules.json` plus environment overrides.
//!
//! The file is parsed once at startup. Every field has a default, unknown
//! fields are ignored, and a missing or malformed file yields the defaults.

use crate::paths::Paths;
use crate::utils::parse_bool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const ENV_AGENT_MODE: &str = "DESKPILOT_AGENT_MODE";
pub const ENV_DEFER_WHEN_AGENT_MODE: &str = "DESKPILOT_DEFER_INTERACTIONS_WHEN_AGENT_MODE";
pub const ENV_DEDUPE_WINDOW_S: &str = "DESKPILOT_DEFERRED_DEDUPE_WINDOW_S";
pub const ENV_DONE_COOLDOWN_S: &str = "DESKPILOT_DEFERRED_DONE_COOLDOWN_S";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRules {
    pub controls: ControlsConfig,
    pub user_activity: UserActivityConfig,
    pub workflow: WorkflowConfig,
    pub deferred: DeferredConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    /// Age after which an owner or pause recorded in the state is not binding.
    pub stale_after_s: f64,
    pub auto_unpause_when_idle: bool,
    /// Owners under which an idle pause may be lifted automatically.
    pub auto_unpause_owner_allowlist: Vec<String>,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            stale_after_s: 10.0,
            auto_unpause_when_idle: true,
            auto_unpause_owner_allowlist: ["", "agent", "workflow_test", "orchestrator", "orchestrator_agent"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserActivityConfig {
    pub any_key_pauses: bool,
    pub esc_only: bool,
    /// Ignore non-ESC input while some owner holds the lease.
    pub esc_only_when_owner_active: bool,
    /// Accumulated pointer travel that counts as the user taking over.
    pub mouse_cm_threshold: f64,
    /// Idle time after which an unscheduled pause lifts itself; 0 disables.
    pub auto_resume_after_idle_s: f64,
    /// Quiet time required before a scheduled resume fires.
    pub resume_requires_quiet_seconds: f64,
    pub popup_enabled: bool,
    pub popup_default_minutes: u32,
    /// Overrides the detected display DPI.
    pub display_dpi: Option<f64>,
}

impl Default for UserActivityConfig {
    fn default() -> Self {
        Self {
            any_key_pauses: true,
            esc_only: false,
            esc_only_when_owner_active: true,
            mouse_cm_threshold: 4.0,
            auto_resume_after_idle_s: 20.0,
            resume_requires_quiet_seconds: 3.0,
            popup_enabled: true,
            popup_default_minutes: 2,
            display_dpi: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub defer_interactions_when_agent_mode: bool,
    /// Lease identity used by workflow runs unless the plan names one.
    pub owner: String,
    pub error_event_types: Vec<String>,
    pub warning_event_types: Vec<String>,
    pub step_output_tail_chars: usize,
    pub error_tail_chars: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            defer_interactions_when_agent_mode: true,
            owner: "workflow_test".to_string(),
            error_event_types: [
                "terminal_focus_failed",
                "terminal_type_failed",
                "text_input_wrong_field",
                "input_aborted_focus_changed",
                "input_aborted_not_ready",
                "vscode_chat_type_failed",
                "vscode_chat_enter_failed",
                "focus_thrash_detected",
                "navigation_step_failed",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            warning_event_types: vec!["chat_not_foreground_when_read".to_string()],
            step_output_tail_chars: 4000,
            error_tail_chars: 800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferredConfig {
    /// A done marker younger than this suppresses re-enqueueing.
    pub done_cooldown_s: f64,
    /// A queued-but-not-done action is not appended again within this window.
    pub dedupe_window_s: f64,
    /// Refuse to execute deferred actions while the control state is stale.
    pub fail_closed_when_stale: bool,
    pub max_per_run: usize,
    /// Log lines scanned at startup to seed the recently-queued cache.
    pub seed_tail_lines: usize,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            done_cooldown_s: 600.0,
            dedupe_window_s: 3600.0,
            fail_closed_when_stale: true,
            max_per_run: 50,
            seed_tail_lines: 500,
        }
    }
}

/// Snapshot of the environment variables this crate reads.
///
/// Kept as a value so tests and callers can inject overrides without
/// mutating the process environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    vars: HashMap<String, String>,
}

impl EnvOverrides {
    pub fn from_process_env() -> Self {
        let vars = [
            ENV_AGENT_MODE,
            ENV_DEFER_WHEN_AGENT_MODE,
            ENV_DEDUPE_WINDOW_S,
            ENV_DONE_COOLDOWN_S,
        ]
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect();
        Self { vars }
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    fn bool(&self, key: &str) -> Option<bool> {
        let raw = self.get(key)?;
        let parsed = parse_bool(raw);
        if parsed.is_none() {
            warn!(key, value = raw, "Ignoring unparseable boolean override");
        }
        parsed
    }

    fn float(&self, key: &str) -> Option<f64> {
        let raw = self.get(key)?;
        match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Some(v),
            _ => {
                warn!(key, value = raw, "Ignoring unparseable numeric override");
                None
            }
        }
    }
}

impl PolicyRules {
    /// Loads `policy_rules.json`, falling back to defaults on any problem.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&raw) {
            Ok(rules) => rules,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed policy rules; using defaults");
                Self::default()
            }
        }
    }

    /// Loads the rules and applies environment overrides on top.
    pub fn load_with_env(path: &Path, env: &EnvOverrides) -> Self {
        let mut rules = Self::load(path);
        rules.apply_env(env);
        rules
    }

    pub fn apply_env(&mut self, env: &EnvOverrides) {
        if let Some(defer) = env.bool(ENV_DEFER_WHEN_AGENT_MODE) {
            self.workflow.defer_interactions_when_agent_mode = defer;
        }
        if let Some(window) = env.float(ENV_DEDUPE_WINDOW_S) {
            self.deferred.dedupe_window_s = window;
        }
        if let Some(cooldown) = env.float(ENV_DONE_COOLDOWN_S) {
            self.deferred.done_cooldown_s = cooldown;
        }
    }
}

/// Where the agent-mode flag was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentModeSource {
    Env,
    UiState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentMode {
    pub active: bool,
    pub source: AgentModeSource,
}

impl AgentMode {
    /// The env override wins when set; otherwise `config/ui_state.json`.
    pub fn detect(paths: &Paths, env: &EnvOverrides) -> Self {
        if let Some(raw) = env.get(ENV_AGENT_MODE) {
            return Self {
                active: parse_bool(raw).unwrap_or(false),
                source: AgentModeSource::Env,
            };
        }
        let active = fs::read_to_string(paths.ui_state())
            .ok()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .and_then(|v| v.get("agent_mode").map(crate::utils::value_as_bool))
            .unwrap_or(false);
        Self {
            active,
            source: AgentModeSource::UiState,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let rules = PolicyRules::load(&dir.path().join("nope.json"));
        assert_eq!(rules, PolicyRules::default());
        assert_eq!(rules.controls.stale_after_s, 10.0);
        assert!(rules.workflow.defer_interactions_when_agent_mode);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy_rules.json");
        fs::write(
            &path,
            r#"{"controls": {"stale_after_s": 30}, "user_activity": {"esc_only": true}, "unrelated": [1]}"#,
        )
        .unwrap();
        let rules = PolicyRules::load(&path);
        assert_eq!(rules.controls.stale_after_s, 30.0);
        assert!(rules.controls.auto_unpause_when_idle);
        assert!(rules.user_activity.esc_only);
        assert_eq!(rules.user_activity.mouse_cm_threshold, 4.0);
    }

    #[test]
    fn test_env_overrides_take_precedence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy_rules.json");
        fs::write(
            &path,
            r#"{"workflow": {"defer_interactions_when_agent_mode": true}, "deferred": {"dedupe_window_s": 5}}"#,
        )
        .unwrap();
        let env = EnvOverrides::default()
            .with(ENV_DEFER_WHEN_AGENT_MODE, "off")
            .with(ENV_DEDUPE_WINDOW_S, "120")
            .with(ENV_DONE_COOLDOWN_S, "not-a-number");
        let rules = PolicyRules::load_with_env(&path, &env);
        assert!(!rules.workflow.defer_interactions_when_agent_mode);
        assert_eq!(rules.deferred.dedupe_window_s, 120.0);
        assert_eq!(rules.deferred.done_cooldown_s, 600.0);
    }

    #[test]
    fn test_agent_mode_sources() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path());
        let none = AgentMode::detect(&paths, &EnvOverrides::default());
        assert!(!none.active);
        assert_eq!(none.source, AgentModeSource::UiState);

        fs::create_dir_all(paths.config_dir()).unwrap();
        fs::write(paths.ui_state(), r#"{"agent_mode": true}"#).unwrap();
        assert!(AgentMode::detect(&paths, &EnvOverrides::default()).active);

        let env = EnvOverrides::default().with(ENV_AGENT_MODE, "0");
        let from_env = AgentMode::detect(&paths, &env);
        assert!(!from_env.active);
        assert_eq!(from_env.source, AgentModeSource::Env);
    }
}
