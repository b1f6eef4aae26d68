//! Workflow runner: takes the lease when it can, runs plan steps, defers
//! interactive steps it may not actuate, and always leaves a summary.
//!
//! A run moves through start (optional reset), acquire-or-passive, step
//! execution and finalize. Finalization is owned by [`RunContext`] and
//! happens exactly once: on the normal path, after Ctrl+C, or from `Drop`
//! when the run future is dropped or panics.

use crate::config::{AgentMode, EnvOverrides, PolicyRules};
use crate::deferred::{DeferredQueue, EnqueueDisposition, EnqueueRequest};
use crate::emergency::EmergencyStop;
use crate::errors::{ControlsError, Result};
use crate::events::{scan_error_events, EventScan};
use crate::lease::{Decision, DecisionReason, Gate, LeaseAcquisition};
use crate::maintenance::{reset, write_json_pretty, ResetOptions, ResetReport};
use crate::pause::PauseController;
use crate::paths::Paths;
use crate::process::{round_seconds, CommandOutput, CommandRunner, INTERRUPTED_EXIT_CODE};
use crate::store::StateStore;
use crate::utils::{file_timestamp, local_timestamp, now_epoch, tail_chars};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A named, ordered list of commands to run under the shared lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub name: String,
    /// Lease identity; defaults to the configured workflow owner.
    #[serde(default)]
    pub owner: Option<String>,
    /// Long-running helper started for the duration of the run.
    #[serde(default)]
    pub housekeeping: Option<Vec<String>>,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub cmd: Vec<String>,
    /// Drives real mouse/keyboard input and therefore needs the lease.
    #[serde(default)]
    pub interactive: bool,
    /// Relative to the workspace root.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl WorkflowPlan {
    /// Loads a plan from `.json`, `.yaml` or `.yml`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| ControlsError::io(path, e))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let plan: WorkflowPlan = if is_yaml {
            serde_yaml::from_str(&raw)
                .map_err(|e| ControlsError::InvalidPlan(format!("{}: {e}", path.display())))?
        } else {
            serde_json::from_str(&raw).map_err(|e| ControlsError::json(path, e))?
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ControlsError::InvalidPlan("plan name is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(ControlsError::InvalidPlan(format!("plan '{}' has no steps", self.name)));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(ControlsError::InvalidPlan(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
            if step.enabled && step.cmd.is_empty() {
                return Err(ControlsError::InvalidPlan(format!(
                    "step '{}' has an empty command",
                    step.name
                )));
            }
        }
        if matches!(&self.housekeeping, Some(cmd) if cmd.is_empty()) {
            return Err(ControlsError::InvalidPlan(
                "housekeeping command is empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pass,
    /// Safely incomplete: some interactive steps were queued.
    Deferred,
    Fail,
}

impl RunStatus {
    /// FAIL > DEFERRED > PASS.
    pub fn resolve(failed: bool, deferred: bool) -> Self {
        if failed {
            RunStatus::Fail
        } else if deferred {
            RunStatus::Deferred
        } else {
            RunStatus::Pass
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Fail => 1,
            RunStatus::Pass | RunStatus::Deferred => 0,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pass => "PASS",
            RunStatus::Deferred => "DEFERRED",
            RunStatus::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub interactive: bool,
    pub pass: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deferred: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defer_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,
    pub seconds: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout_tail: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr_tail: String,
}

/// An error or warning entry in the summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Issue {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<Value>,
}

impl Issue {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeaseReport {
    pub owner: String,
    pub acquired: bool,
    /// Why the run started passive-only, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passive_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSummary {
    pub run_id: String,
    pub plan: String,
    pub started: String,
    pub finished: Option<String>,
    pub status: RunStatus,
    pub agent_mode: AgentMode,
    pub lease: LeaseReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset: Option<ResetReport>,
    pub steps: Vec<StepRecord>,
    pub deferred_actions: Vec<String>,
    /// Deferred ids that were not appended under this run because they
    /// were already queued or recently done.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suppressed_actions: Vec<String>,
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
    pub interrupted: bool,
    pub recommendations: Vec<String>,
}

impl WorkflowSummary {
    fn new(run_id: String, plan: &str, owner: &str, agent_mode: AgentMode) -> Self {
        Self {
            run_id,
            plan: plan.to_string(),
            started: local_timestamp(),
            finished: None,
            status: RunStatus::Fail,
            agent_mode,
            lease: LeaseReport {
                owner: owner.to_string(),
                ..LeaseReport::default()
            },
            reset: None,
            steps: Vec::new(),
            deferred_actions: Vec::new(),
            suppressed_actions: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            interrupted: false,
            recommendations: Vec::new(),
        }
    }

    pub fn any_deferred(&self) -> bool {
        self.steps.iter().any(|s| s.deferred)
    }

    pub fn any_failed(&self) -> bool {
        !self.errors.is_empty() || self.steps.iter().any(|s| !s.pass)
    }
}

/// Result of [`WorkflowRunner::run`].
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub summary: WorkflowSummary,
    /// Where the summary was written; `None` if writing failed.
    pub summary_path: Option<PathBuf>,
}

impl WorkflowOutcome {
    pub fn exit_code(&self) -> i32 {
        self.summary.status.exit_code()
    }
}

/// Options applied at the start of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub reset: Option<ResetOptions>,
}

/// Latching interrupt flag shared between a signal listener and the runner.
#[derive(Debug, Clone)]
pub struct Interrupt {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`Interrupt::trigger`] has been called.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Triggers on the first Ctrl+C delivered to the process.
    pub fn listen_for_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let interrupt = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl+C received; finalizing workflow");
                interrupt.trigger();
            }
        })
    }
}

pub fn new_run_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", file_timestamp(), &uuid[..8])
}

/// Per-run mutable state and the once-only finalizer.
pub(crate) struct RunContext {
    paths: Paths,
    gate: Gate,
    owner: String,
    /// Whether this run currently believes it holds the lease.
    holds_lease: bool,
    housekeeping: Option<tokio::process::Child>,
    summary: WorkflowSummary,
    finalized: bool,
    summary_path: Option<PathBuf>,
}

impl RunContext {
    pub(crate) fn new(paths: Paths, gate: Gate, summary: WorkflowSummary) -> Self {
        let owner = summary.lease.owner.clone();
        Self {
            paths,
            gate,
            owner,
            holds_lease: false,
            housekeeping: None,
            summary,
            finalized: false,
            summary_path: None,
        }
    }

    pub(crate) fn record_interrupt(&mut self, note: &str) {
        if !self.summary.interrupted {
            self.summary.interrupted = true;
            self.summary
                .errors
                .push(Issue::named("workflow_interrupted").note(note));
        }
    }

    /// Resolves status, writes the summary, releases the lease if still ours
    /// and stops housekeeping. Later calls are no-ops.
    pub(crate) fn finalize(&mut self) -> Option<PathBuf> {
        if self.finalized {
            return self.summary_path.clone();
        }
        self.finalized = true;

        self.summary.finished = Some(local_timestamp());
        self.summary.status = RunStatus::resolve(self.summary.any_failed(), self.summary.any_deferred());
        self.summary.recommendations = recommendations(&self.summary);

        let path = self.paths.workflow_summary(&self.summary.run_id);
        match write_json_pretty(&path, &self.summary) {
            Ok(()) => {
                info!(path = %path.display(), status = %self.summary.status, "Workflow summary written");
                self.summary_path = Some(path);
            }
            Err(e) => error!(error = %e, "Failed to write workflow summary"),
        }

        if self.holds_lease {
            self.gate.release(&self.owner);
            self.holds_lease = false;
        }

        if let Some(mut child) = self.housekeeping.take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Housekeeping process already exited");
            }
        }

        self.summary_path.clone()
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(run_id = %self.summary.run_id, "Workflow ended before finalization; finalizing now");
            self.summary
                .errors
                .push(Issue::named("workflow_aborted").note("run ended before normal finalization"));
            self.finalize();
        }
    }
}

/// Reason string recorded when a gate denial forces a deferral.
fn denial_reason(decision: &Decision) -> String {
    match decision.reason {
        DecisionReason::ControlsPaused => "controls_state.paused".to_string(),
        ref other => other.to_string(),
    }
}

pub struct WorkflowRunner {
    paths: Paths,
    rules: PolicyRules,
    env: EnvOverrides,
    gate: Gate,
    pause: PauseController,
    queue: DeferredQueue,
    runner: Arc<dyn CommandRunner>,
    interrupt: Interrupt,
}

impl WorkflowRunner {
    pub fn new(
        paths: Paths,
        rules: PolicyRules,
        env: EnvOverrides,
        store: Arc<dyn StateStore>,
        emergency: EmergencyStop,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let queue = DeferredQueue::open(&paths, rules.deferred.clone());
        Self {
            gate: Gate::new(store.clone(), emergency),
            pause: PauseController::new(store),
            queue,
            paths,
            rules,
            env,
            runner,
            interrupt: Interrupt::new(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn queue(&self) -> &DeferredQueue {
        &self.queue
    }

    pub async fn run(&self, plan: &WorkflowPlan, options: &RunOptions) -> WorkflowOutcome {
        let run_id = new_run_id();
        let started_at = now_epoch();
        let owner = plan
            .owner
            .clone()
            .filter(|o| !o.trim().is_empty())
            .unwrap_or_else(|| self.rules.workflow.owner.clone());
        let agent_mode = AgentMode::detect(&self.paths, &self.env);
        info!(%run_id, plan = %plan.name, %owner, agent_mode = agent_mode.active, "Starting workflow");

        let summary = WorkflowSummary::new(run_id, &plan.name, &owner, agent_mode.clone());
        let mut ctx = RunContext::new(self.paths.clone(), self.gate.clone(), summary);

        if let Some(reset_options) = &options.reset {
            ctx.summary.reset = Some(reset(&self.gate, &self.pause, &self.rules, reset_options));
        }

        if let Some(cmd) = &plan.housekeeping {
            match self.spawn_housekeeping(cmd) {
                Ok(child) => ctx.housekeeping = Some(child),
                Err(e) => ctx
                    .summary
                    .warnings
                    .push(Issue::named("housekeeping_not_started").note(e.to_string())),
            }
        }

        self.acquire_or_passive(&mut ctx, &agent_mode);

        for step in &plan.steps {
            if self.interrupt.is_triggered() {
                ctx.record_interrupt("interrupted between steps");
                break;
            }
            let record = self.execute_step(step, &mut ctx).await;
            let interrupted = record.returncode == Some(INTERRUPTED_EXIT_CODE) && self.interrupt.is_triggered();
            ctx.summary.steps.push(record);
            if interrupted {
                ctx.record_interrupt(&format!("interrupted during step '{}'", step.name));
                break;
            }
        }

        let scan = scan_error_events(&self.paths.error_events(), started_at, &self.rules.workflow);
        record_event_scan(&mut ctx.summary, &scan);

        let summary_path = ctx.finalize();
        WorkflowOutcome {
            summary: ctx.summary.clone(),
            summary_path,
        }
    }

    fn acquire_or_passive(&self, ctx: &mut RunContext, agent_mode: &AgentMode) {
        if agent_mode.active && self.rules.workflow.defer_interactions_when_agent_mode {
            info!("Agent mode active; running passive-only");
            ctx.summary.lease.passive_reason = Some("agent_mode".to_string());
            return;
        }
        let stale_after_s = self.rules.controls.stale_after_s;
        match self.gate.try_acquire(&ctx.owner, stale_after_s) {
            LeaseAcquisition::Acquired(decision) => {
                ctx.holds_lease = true;
                ctx.summary.lease.acquired = true;
                if let DecisionReason::OwnerStale(previous) = &decision.reason {
                    ctx.summary.warnings.push(
                        Issue::named("stale_owner_overridden").note(format!("previous owner '{previous}'")),
                    );
                }
            }
            LeaseAcquisition::Denied(decision) => {
                info!(reason = %decision.reason, "Controls unavailable; running passive-only");
                ctx.summary.lease.passive_reason = Some(denial_reason(&decision));
            }
            LeaseAcquisition::Lost { to } => {
                ctx.summary.lease.passive_reason = Some(format!("controls_lost_to:{to}"));
            }
        }
    }

    /// Fresh defer-or-run decision for one interactive step. `None` means run.
    fn defer_reason(&self, ctx: &mut RunContext) -> Option<String> {
        let agent_mode = AgentMode::detect(&self.paths, &self.env);
        if agent_mode.active && self.rules.workflow.defer_interactions_when_agent_mode {
            return Some("agent_mode".to_string());
        }
        let stale_after_s = self.rules.controls.stale_after_s;

        if ctx.holds_lease {
            let decision = self.gate.may_proceed(&ctx.owner, stale_after_s);
            if decision.allowed {
                // Refresh ts so other actors keep seeing a live owner.
                self.gate.set_owner(&ctx.owner);
                return None;
            }
            if matches!(decision.reason, DecisionReason::OwnedBy(_)) {
                warn!(reason = %decision.reason, "Lease taken over mid-run");
                ctx.holds_lease = false;
            }
            return Some(denial_reason(&decision));
        }

        match self.gate.try_acquire(&ctx.owner, stale_after_s) {
            LeaseAcquisition::Acquired(_) => {
                info!(owner = %ctx.owner, "Controls became available mid-run");
                ctx.holds_lease = true;
                ctx.summary.lease.acquired = true;
                None
            }
            LeaseAcquisition::Denied(decision) => Some(denial_reason(&decision)),
            LeaseAcquisition::Lost { to } => Some(format!("controls_lost_to:{to}")),
        }
    }

    async fn execute_step(&self, step: &WorkflowStep, ctx: &mut RunContext) -> StepRecord {
        let mut record = StepRecord {
            name: step.name.clone(),
            interactive: step.interactive,
            ..StepRecord::default()
        };

        if !step.enabled {
            record.pass = true;
            record.skipped = true;
            ctx.summary
                .warnings
                .push(Issue::named(format!("{}_skipped", step.name)).note("step disabled in plan"));
            return record;
        }

        if step.interactive {
            if let Some(reason) = self.defer_reason(ctx) {
                self.defer_step(step, &reason, ctx, &mut record);
                return record;
            }
        }

        let cwd = match &step.cwd {
            Some(dir) if !dir.trim().is_empty() => self.paths.root().join(dir),
            _ => self.paths.root().to_path_buf(),
        };
        let started = Instant::now();
        debug!(step = %step.name, "Running workflow step");

        let outcome = tokio::select! {
            result = self.runner.run(&step.cmd, &cwd) => Some(result),
            _ = self.interrupt.triggered() => None,
        };

        let tail = self.rules.workflow.step_output_tail_chars;
        match outcome {
            Some(Ok(output)) => self.record_output(&mut record, &output, tail),
            Some(Err(e)) => {
                record.pass = false;
                record.returncode = Some(-1);
                record.seconds = round_seconds(started.elapsed().as_secs_f64());
                record.stderr_tail = tail_chars(&e.to_string(), tail);
            }
            None => {
                record.pass = false;
                record.returncode = Some(INTERRUPTED_EXIT_CODE);
                record.seconds = round_seconds(started.elapsed().as_secs_f64());
                record.stderr_tail = "interrupted (SIGINT)".to_string();
            }
        }

        if !record.pass {
            ctx.summary.errors.push(Issue {
                name: step.name.clone(),
                returncode: record.returncode,
                stderr_tail: Some(tail_chars(&record.stderr_tail, self.rules.workflow.error_tail_chars)),
                ..Issue::default()
            });
        }
        info!(step = %step.name, pass = record.pass, seconds = record.seconds, "Workflow step finished");
        record
    }

    fn record_output(&self, record: &mut StepRecord, output: &CommandOutput, tail: usize) {
        record.pass = output.success();
        record.returncode = Some(output.returncode());
        record.seconds = output.seconds;
        record.stdout_tail = tail_chars(&output.stdout, tail);
        record.stderr_tail = tail_chars(&output.stderr, tail);
    }

    fn defer_step(&self, step: &WorkflowStep, reason: &str, ctx: &mut RunContext, record: &mut StepRecord) {
        let request = EnqueueRequest {
            name: step.name.clone(),
            cmd: step.cmd.clone(),
            cwd: step.cwd.clone().unwrap_or_default(),
            reason: reason.to_string(),
            run_id: ctx.summary.run_id.clone(),
        };
        match self.queue.enqueue(&request) {
            Ok(enqueued) => {
                record.pass = true;
                record.deferred = true;
                record.defer_reason = Some(reason.to_string());
                record.action_id = Some(enqueued.id.clone());
                if enqueued.disposition != EnqueueDisposition::Appended {
                    debug!(id = %enqueued.id, disposition = ?enqueued.disposition, "Deferred step not re-queued");
                    ctx.summary.suppressed_actions.push(enqueued.id.clone());
                }
                ctx.summary.deferred_actions.push(enqueued.id);
                info!(step = %step.name, reason, "Interactive step deferred");
            }
            Err(e) => {
                record.pass = false;
                ctx.summary
                    .errors
                    .push(Issue::named(format!("{}_defer_failed", step.name)).note(e.to_string()));
            }
        }
    }

    fn spawn_housekeeping(&self, cmd: &[String]) -> Result<tokio::process::Child> {
        let (program, args) = cmd
            .split_first()
            .ok_or_else(|| ControlsError::InvalidArgument("empty housekeeping command".to_string()))?;
        tokio::process::Command::new(program)
            .args(args)
            .current_dir(self.paths.root())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ControlsError::Execution(format!("failed to start '{program}': {e}")))
    }
}

fn record_event_scan(summary: &mut WorkflowSummary, scan: &EventScan) {
    if scan.has_errors() {
        summary.errors.push(Issue {
            name: "error_events_detected".to_string(),
            count: Some(scan.errors.len()),
            samples: scan.error_samples(),
            ..Issue::default()
        });
    }
    if !scan.warnings.is_empty() {
        summary.warnings.push(Issue {
            name: "warning_events_detected".to_string(),
            count: Some(scan.warnings.len()),
            samples: scan.warning_samples(),
            ..Issue::default()
        });
    }
}

/// Follow-up hints derived from the outcome.
pub fn recommendations(summary: &WorkflowSummary) -> Vec<String> {
    let mut out = Vec::new();

    if let Some(reason) = &summary.lease.passive_reason {
        out.push(format!("Run started passive-only ({reason})."));
        if reason == "agent_mode" {
            out.push("Turn agent mode off (DESKPILOT_AGENT_MODE=0) for full interactive coverage.".to_string());
        } else if reason == "controls_state.paused" {
            out.push("Unpause with `deskpilot unpause` when the desktop is free.".to_string());
        } else if let Some(owner) = reason.strip_prefix("controls_owned_by:") {
            out.push(format!(
                "Controls were held by '{owner}'; wait for release or run `deskpilot release-owner --if-owner {owner}`."
            ));
        } else if reason == "emergency_stop" {
            out.push("Clear the emergency stop with `deskpilot emergency-stop clear` once it is safe.".to_string());
        }
    }

    if summary.any_deferred() {
        let deferred = summary.steps.iter().filter(|s| s.deferred).count();
        // Suppressed ids live under an earlier run's lines, so a run-scoped
        // filter would match nothing.
        let selector = if summary.suppressed_actions.is_empty() {
            format!("--run-id {}", summary.run_id)
        } else {
            let mut ids: Vec<&str> = Vec::new();
            for id in &summary.deferred_actions {
                if !ids.contains(&id.as_str()) {
                    ids.push(id);
                }
            }
            ids.iter().map(|id| format!("--id {id}")).collect::<Vec<_>>().join(" ")
        };
        out.push(format!(
            "{deferred} interactive step(s) deferred; run `deskpilot deferred run {selector} --live` once controls are free."
        ));
    }

    for step in summary.steps.iter().filter(|s| !s.pass) {
        match step.returncode {
            Some(code) => out.push(format!("Investigate failing step '{}' (returncode {code}).", step.name)),
            None => out.push(format!("Investigate failing step '{}'.", step.name)),
        }
    }

    if summary.errors.iter().any(|e| e.name == "error_events_detected") {
        out.push("Error-class events were logged during the run; inspect logs/errors/events.jsonl.".to_string());
    }
    if summary.interrupted {
        out.push("The run was interrupted; re-run the workflow to get a complete result.".to_string());
    }
    out
}
