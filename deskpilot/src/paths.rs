//! On-disk layout of the shared coordination files.
//!
//! Every path is resolved relative to one workspace root so that callers
//! never depend on the process working directory.

use std::path::{Path, PathBuf};

/// Resolved locations of every persisted coordination artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn controls_state(&self) -> PathBuf {
        self.config_dir().join("controls_state.json")
    }

    pub fn emergency_stop(&self) -> PathBuf {
        self.config_dir().join("emergency_stop.json")
    }

    pub fn policy_rules(&self) -> PathBuf {
        self.config_dir().join("policy_rules.json")
    }

    pub fn ui_state(&self) -> PathBuf {
        self.config_dir().join("ui_state.json")
    }

    pub fn actions_dir(&self) -> PathBuf {
        self.root.join("logs").join("actions")
    }

    pub fn deferred_queue(&self) -> PathBuf {
        self.actions_dir().join("deferred_workflow_actions.jsonl")
    }

    pub fn deferred_done_dir(&self) -> PathBuf {
        self.actions_dir().join("deferred_workflow_actions_done")
    }

    pub fn deferred_results(&self) -> PathBuf {
        self.actions_dir()
            .join("deferred_workflow_actions_results.jsonl")
    }

    pub fn user_activity_events(&self) -> PathBuf {
        self.actions_dir().join("user_activity_events.jsonl")
    }

    pub fn error_events(&self) -> PathBuf {
        self.root.join("logs").join("errors").join("events.jsonl")
    }

    pub fn tests_dir(&self) -> PathBuf {
        self.root.join("logs").join("tests")
    }

    pub fn workflow_summary(&self, run_id: &str) -> PathBuf {
        self.tests_dir()
            .join(format!("workflow_summary_{run_id}.json"))
    }

    pub fn tool_log_dir(&self) -> PathBuf {
        self.root.join("logs").join("deskpilot")
    }
}
