//! File-backed coordination for desktop IDE automation.
//!
//! Several independent processes (a user-activity monitor, workflow
//! runners, manual CLI tools) share the mouse and keyboard. They coordinate
//! through one advisory JSON document: an owner lease, a global pause flag
//! and a timestamp that makes abandoned claims go stale. Interactive work
//! that cannot run right now is queued and replayed later.

use std::path::PathBuf;
use std::sync::Arc;

pub mod config;
pub mod deferred;
pub mod emergency;
pub mod errors;
pub mod events;
pub mod lease;
pub mod maintenance;
pub mod pause;
pub mod paths;
pub mod process;
pub mod state;
pub mod store;
pub mod utils;
pub mod workflow;

pub use config::{AgentMode, AgentModeSource, EnvOverrides, PolicyRules};
pub use deferred::{DeferredAction, DeferredQueue, ExecutionGuard, PendingFilter};
pub use emergency::{EmergencyStop, EmergencyStopStatus};
pub use errors::{ControlsError, Result};
pub use lease::{Decision, DecisionReason, Gate, LeaseAcquisition, ReleaseOutcome, ReleaseRequest};
pub use pause::{PauseController, ResumeChoice, ResumeKind, ResumePrompt};
pub use paths::Paths;
pub use process::{CommandOutput, CommandRunner, ProcessRunner};
pub use state::{ControlState, StatePatch};
pub use store::{is_stale, FileStateStore, MemoryStateStore, StateStore};
pub use workflow::{RunStatus, WorkflowPlan, WorkflowRunner, WorkflowSummary};

/// Everything rooted at one workspace directory, wired together.
///
/// Components receive the store by injection; this type only does the
/// wiring so binaries do not repeat it.
#[derive(Clone)]
pub struct Workspace {
    paths: Paths,
    rules: PolicyRules,
    env: EnvOverrides,
    store: Arc<dyn StateStore>,
    emergency: EmergencyStop,
}

impl Workspace {
    /// File-backed workspace using the process environment for overrides.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let paths = Paths::new(root);
        let env = EnvOverrides::from_process_env();
        let rules = PolicyRules::load_with_env(&paths.policy_rules(), &env);
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(paths.controls_state()));
        let emergency = EmergencyStop::new(paths.emergency_stop());
        Self::from_parts(paths, rules, env, store, emergency)
    }

    pub fn from_parts(
        paths: Paths,
        rules: PolicyRules,
        env: EnvOverrides,
        store: Arc<dyn StateStore>,
        emergency: EmergencyStop,
    ) -> Self {
        Self {
            paths,
            rules,
            env,
            store,
            emergency,
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn rules(&self) -> &PolicyRules {
        &self.rules
    }

    pub fn env(&self) -> &EnvOverrides {
        &self.env
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn gate(&self) -> Gate {
        Gate::new(self.store.clone(), self.emergency.clone())
    }

    pub fn pause_controller(&self) -> PauseController {
        PauseController::new(self.store.clone())
    }

    pub fn emergency_stop(&self) -> &EmergencyStop {
        &self.emergency
    }

    pub fn agent_mode(&self) -> AgentMode {
        AgentMode::detect(&self.paths, &self.env)
    }

    pub fn deferred_queue(&self) -> DeferredQueue {
        DeferredQueue::open(&self.paths, self.rules.deferred.clone())
    }

    /// Guard used by the deferred executor, acting as `owner`.
    pub fn controls_guard(&self, owner: &str) -> deferred::ControlsGuard {
        deferred::ControlsGuard::new(
            self.gate(),
            self.paths.clone(),
            self.env.clone(),
            owner,
            self.rules.controls.stale_after_s,
            self.rules.deferred.fail_closed_when_stale,
        )
    }

    pub fn workflow_runner(&self, runner: Arc<dyn CommandRunner>) -> WorkflowRunner {
        WorkflowRunner::new(
            self.paths.clone(),
            self.rules.clone(),
            self.env.clone(),
            self.store.clone(),
            self.emergency.clone(),
            runner,
        )
    }
}
