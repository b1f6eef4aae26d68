//! Append-only queue of interactive steps that could not run when they
//! were reached, plus the executor that replays them once it is safe.
//!
//! The queue file is never rewritten implicitly. An action counts as done
//! only when its done marker exists; markers are written for failures too.

use crate::config::{AgentMode, DeferredConfig, EnvOverrides};
use crate::errors::{ControlsError, Result};
use crate::lease::Gate;
use crate::paths::Paths;
use crate::process::CommandRunner;
use crate::store::is_stale;
use crate::utils::{file_timestamp, local_timestamp, now_epoch, parse_timestamp_str, sanitize_tag, tail_chars};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

/// Joins command tokens before hashing. U+241F SYMBOL FOR UNIT SEPARATOR.
const CMD_TOKEN_SEPARATOR: &str = "\u{241f}";

const OUTPUT_TAIL_CHARS: usize = 4000;

/// Stable identity of an action: first 16 hex chars of blake3 over the
/// name and the command tokens.
pub fn action_id(name: &str, cmd: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
    hasher.update(cmd.join(CMD_TOKEN_SEPARATOR).as_bytes());
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..16].to_string()
}

/// Done marker location. An empty `run_id` gives the global marker.
pub fn done_marker_path(done_dir: &Path, action_id: &str, run_id: &str) -> PathBuf {
    let action_id = action_id.trim();
    let run_id = run_id.trim();
    if run_id.is_empty() {
        done_dir.join(format!("{action_id}.json"))
    } else {
        done_dir.join(format!("{action_id}__run_{}.json", sanitize_tag(run_id)))
    }
}

/// One line of the queue log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredAction {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub name: String,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub reason: String,
}

impl DeferredAction {
    /// The recorded id, or the stable hash when an older line omitted it.
    pub fn resolved_id(&self) -> String {
        let id = self.id.trim();
        if id.is_empty() {
            action_id(&self.name, &self.cmd)
        } else {
            id.to_string()
        }
    }
}

/// What a workflow wants to defer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueRequest {
    pub name: String,
    pub cmd: Vec<String>,
    pub cwd: String,
    pub reason: String,
    pub run_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueDisposition {
    Appended,
    /// A done marker newer than the cooldown exists.
    SuppressedDone,
    /// Already queued within the dedupe window and not yet done.
    SuppressedQueued,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enqueued {
    pub id: String,
    pub disposition: EnqueueDisposition,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingFilter {
    pub ids: Vec<String>,
    pub run_ids: Vec<String>,
    /// Key done markers and dedupe by `(id, run_id)`. Implied by `run_ids`.
    pub per_run: bool,
    /// Include actions whose done marker exists.
    pub force: bool,
    /// Return every queued line instead of the latest per key.
    pub all: bool,
}

impl PendingFilter {
    pub fn is_per_run(&self) -> bool {
        self.per_run || self.run_ids.iter().any(|r| !r.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingAction {
    #[serde(flatten)]
    pub action: DeferredAction,
    pub queued_count: usize,
}

/// Contents of a done marker and of each results-log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: String,
    pub run_id: String,
    pub name: String,
    pub cmd: Vec<String>,
    pub returncode: i32,
    pub ok: bool,
    pub seconds: f64,
    pub ts: String,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

/// Consulted immediately before each deferred action runs.
pub trait ExecutionGuard: Send + Sync {
    /// `Some(reason)` when execution must stop now.
    fn blocked(&self) -> Option<String>;
}

/// Production guard: agent mode, stale state, emergency stop, pause and
/// foreign owner, in that order.
pub struct ControlsGuard {
    gate: Gate,
    paths: Paths,
    env: EnvOverrides,
    owner: String,
    stale_after_s: f64,
    fail_closed_when_stale: bool,
}

impl ControlsGuard {
    pub fn new(
        gate: Gate,
        paths: Paths,
        env: EnvOverrides,
        owner: impl Into<String>,
        stale_after_s: f64,
        fail_closed_when_stale: bool,
    ) -> Self {
        Self {
            gate,
            paths,
            env,
            owner: owner.into(),
            stale_after_s,
            fail_closed_when_stale,
        }
    }
}

impl ExecutionGuard for ControlsGuard {
    fn blocked(&self) -> Option<String> {
        if AgentMode::detect(&self.paths, &self.env).active {
            return Some("agent_mode".to_string());
        }
        let state = self.gate.store().read();
        if self.fail_closed_when_stale && is_stale(&state, self.stale_after_s) {
            return Some("controls_state.stale".to_string());
        }
        let decision = self.gate.may_proceed(&self.owner, self.stale_after_s);
        (!decision.allowed).then(|| decision.reason.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteOptions {
    pub filter: PendingFilter,
    /// Upper bound on attempted actions.
    pub max: usize,
    /// Without this nothing is executed; the report lists what would run.
    pub live: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub pending: Vec<PendingAction>,
    pub results: Vec<ActionResult>,
    pub attempted: usize,
    pub dry_run: bool,
    /// Why the batch stopped early, if it did.
    pub stopped: Option<String>,
}

impl ExecutionReport {
    pub fn failed(&self) -> bool {
        self.results.iter().any(|r| !r.ok)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PruneReport {
    pub kept: usize,
    pub removed: usize,
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSummary {
    pub path: PathBuf,
    pub exists: bool,
    pub lines: usize,
    pub parsed: usize,
    pub unique_ids: usize,
}

pub struct DeferredQueue {
    queue_path: PathBuf,
    done_dir: PathBuf,
    results_path: PathBuf,
    root: PathBuf,
    cfg: DeferredConfig,
    /// Action id to the epoch second it was last appended.
    recent: Mutex<HashMap<String, f64>>,
}

impl DeferredQueue {
    /// Opens the queue and seeds the recently-queued cache from the log tail.
    pub fn open(paths: &Paths, cfg: DeferredConfig) -> Self {
        let queue = Self {
            queue_path: paths.deferred_queue(),
            done_dir: paths.deferred_done_dir(),
            results_path: paths.deferred_results(),
            root: paths.root().to_path_buf(),
            cfg,
            recent: Mutex::new(HashMap::new()),
        };
        queue.seed_recent();
        queue
    }

    pub fn path(&self) -> &Path {
        &self.queue_path
    }

    pub fn done_dir(&self) -> &Path {
        &self.done_dir
    }

    fn seed_recent(&self) {
        let Ok(raw) = fs::read_to_string(&self.queue_path) else {
            return;
        };
        let lines: Vec<&str> = raw.lines().collect();
        let start = lines.len().saturating_sub(self.cfg.seed_tail_lines);
        let Ok(mut recent) = self.recent.lock() else {
            return;
        };
        for line in &lines[start..] {
            let Some(action) = parse_line(line) else {
                continue;
            };
            let Some(created) = parse_timestamp_str(&action.created) else {
                continue;
            };
            let entry = recent.entry(action.resolved_id()).or_insert(created);
            *entry = entry.max(created);
        }
        debug!(seeded = recent.len(), "Seeded recently-queued cache");
    }

    /// Appends an action unless it was recently satisfied or is already queued.
    pub fn enqueue(&self, request: &EnqueueRequest) -> Result<Enqueued> {
        self.enqueue_at(request, now_epoch())
    }

    pub fn enqueue_at(&self, request: &EnqueueRequest, now: f64) -> Result<Enqueued> {
        let id = action_id(&request.name, &request.cmd);

        if let Some(done_at) = self.latest_done_marker(&id) {
            if now - done_at <= self.cfg.done_cooldown_s {
                debug!(%id, name = %request.name, "Deferred action done recently; not queueing");
                return Ok(Enqueued {
                    id,
                    disposition: EnqueueDisposition::SuppressedDone,
                });
            }
        }

        let mut recent = self
            .recent
            .lock()
            .map_err(|_| ControlsError::Execution("deferred queue cache poisoned".to_string()))?;

        if let Some(queued_at) = recent.get(&id) {
            let within_window = now - queued_at <= self.cfg.dedupe_window_s;
            if within_window && self.latest_done_marker(&id).is_none() {
                debug!(%id, name = %request.name, "Deferred action already queued");
                return Ok(Enqueued {
                    id,
                    disposition: EnqueueDisposition::SuppressedQueued,
                });
            }
        }

        let action = DeferredAction {
            id: id.clone(),
            run_id: request.run_id.clone(),
            created: local_timestamp(),
            name: request.name.clone(),
            cmd: request.cmd.clone(),
            cwd: request.cwd.clone(),
            reason: request.reason.clone(),
        };
        append_json_line(&self.queue_path, &action)?;
        recent.insert(id.clone(), now);
        info!(%id, name = %request.name, reason = %request.reason, "Deferred interactive action");

        Ok(Enqueued {
            id,
            disposition: EnqueueDisposition::Appended,
        })
    }

    /// Newest modification time among the global marker and the markers of
    /// every run that executed `id`.
    fn latest_done_marker(&self, id: &str) -> Option<f64> {
        let entries = fs::read_dir(&self.done_dir).ok()?;
        let global = format!("{id}.json");
        let run_prefix = format!("{id}__run_");
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name == global.as_str()
                    || (name.starts_with(run_prefix.as_str()) && name.ends_with(".json"))
            })
            .filter_map(|entry| entry.metadata().ok()?.modified().ok())
            .filter_map(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .reduce(f64::max)
    }

    /// Whether this queue line has already been executed. Per-run views only
    /// honour the line's own marker; the global view also counts the global one.
    fn is_done(&self, action: &DeferredAction, per_run: bool) -> bool {
        let own_marker = done_marker_path(&self.done_dir, &action.id, &action.run_id);
        if per_run {
            return own_marker.exists();
        }
        done_marker_path(&self.done_dir, &action.id, "").exists() || own_marker.exists()
    }

    fn read_actions(&self) -> Result<Vec<DeferredAction>> {
        match fs::read_to_string(&self.queue_path) {
            Ok(raw) => Ok(raw.lines().filter_map(parse_line).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(ControlsError::io(&self.queue_path, e)),
        }
    }

    /// Actions without a done marker, latest occurrence per key, in file order.
    pub fn list_pending(&self, filter: &PendingFilter) -> Result<Vec<PendingAction>> {
        let per_run = filter.is_per_run();
        let only_ids: HashSet<&str> = filter
            .ids
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        let only_runs: HashSet<&str> = filter
            .run_ids
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();

        let mut candidates = Vec::new();
        for mut action in self.read_actions()? {
            action.id = action.resolved_id();
            if !only_runs.is_empty() && !only_runs.contains(action.run_id.trim()) {
                continue;
            }
            if !only_ids.is_empty() && !only_ids.contains(action.id.as_str()) {
                continue;
            }
            if !filter.force && self.is_done(&action, per_run) {
                continue;
            }
            candidates.push(action);
        }

        if filter.all {
            return Ok(candidates
                .into_iter()
                .map(|action| PendingAction {
                    action,
                    queued_count: 1,
                })
                .collect());
        }

        let key = |a: &DeferredAction| {
            if per_run {
                format!("{}::{}", a.id, a.run_id)
            } else {
                a.id.clone()
            }
        };

        let mut counts: HashMap<String, usize> = HashMap::new();
        for action in &candidates {
            *counts.entry(key(action)).or_default() += 1;
        }

        // Walk backwards so the last line per key wins, then restore file order.
        let mut seen = HashSet::new();
        let mut latest = Vec::new();
        for action in candidates.into_iter().rev() {
            let k = key(&action);
            if seen.insert(k.clone()) {
                let queued_count = counts.get(&k).copied().unwrap_or(1);
                latest.push(PendingAction {
                    action,
                    queued_count,
                });
            }
        }
        latest.reverse();
        Ok(latest)
    }

    /// Executes pending actions in order, re-checking `guard` before each
    /// one and stopping at the first failure.
    pub async fn execute_pending(
        &self,
        options: &ExecuteOptions,
        guard: &dyn ExecutionGuard,
        runner: &dyn CommandRunner,
    ) -> Result<ExecutionReport> {
        let pending = self.list_pending(&options.filter)?;
        let mut report = ExecutionReport {
            pending: pending.clone(),
            dry_run: !options.live,
            ..ExecutionReport::default()
        };

        if !options.live || pending.is_empty() {
            return Ok(report);
        }

        let per_run = options.filter.is_per_run();
        for item in pending.into_iter().take(options.max) {
            let action = item.action;
            let marker_run = if per_run { action.run_id.clone() } else { String::new() };
            let marker = done_marker_path(&self.done_dir, &action.id, &marker_run);
            if marker.exists() && !options.filter.force {
                continue;
            }

            if let Some(reason) = guard.blocked() {
                info!(%reason, "Controls unavailable; stopping deferred execution");
                report.stopped = Some(reason);
                break;
            }

            report.attempted += 1;
            let cwd = if action.cwd.trim().is_empty() {
                self.root.clone()
            } else {
                self.root.join(action.cwd.trim())
            };

            let result = match runner.run(&action.cmd, &cwd).await {
                Ok(output) => ActionResult {
                    id: action.id.clone(),
                    run_id: action.run_id.clone(),
                    name: action.name.clone(),
                    cmd: action.cmd.clone(),
                    returncode: output.returncode(),
                    ok: output.success(),
                    seconds: output.seconds,
                    ts: local_timestamp(),
                    stdout_tail: tail_chars(&output.stdout, OUTPUT_TAIL_CHARS),
                    stderr_tail: tail_chars(&output.stderr, OUTPUT_TAIL_CHARS),
                },
                Err(e) => ActionResult {
                    id: action.id.clone(),
                    run_id: action.run_id.clone(),
                    name: action.name.clone(),
                    cmd: action.cmd.clone(),
                    returncode: -1,
                    ok: false,
                    seconds: 0.0,
                    ts: local_timestamp(),
                    stdout_tail: String::new(),
                    stderr_tail: tail_chars(&e.to_string(), OUTPUT_TAIL_CHARS),
                },
            };

            self.record_result(&marker, &result);
            info!(
                id = %result.id,
                name = %result.name,
                ok = result.ok,
                seconds = result.seconds,
                "Deferred action finished"
            );

            let ok = result.ok;
            report.results.push(result);
            if !ok {
                report.stopped = Some(format!("action_failed:{}", action.id));
                break;
            }
        }

        Ok(report)
    }

    /// Results log and done marker. Both are best effort: a lost marker only
    /// means the action may be offered again.
    fn record_result(&self, marker: &Path, result: &ActionResult) {
        if let Err(e) = append_json_line(&self.results_path, result) {
            warn!(error = %e, "Failed to append deferred result");
        }
        let written = fs::create_dir_all(&self.done_dir)
            .map_err(|e| e.to_string())
            .and_then(|_| serde_json::to_string_pretty(result).map_err(|e| e.to_string()))
            .and_then(|body| fs::write(marker, body).map_err(|e| e.to_string()));
        if let Err(e) = written {
            warn!(marker = %marker.display(), error = %e, "Failed to write done marker");
        }
    }

    /// Rewrites the log keeping the latest line per action id, after
    /// copying the original to `<file>.bak_<timestamp>`.
    pub fn prune(&self) -> Result<PruneReport> {
        let actions = self.read_actions()?;
        if !self.queue_path.exists() {
            return Ok(PruneReport {
                kept: 0,
                removed: 0,
                backup: None,
            });
        }

        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, DeferredAction> = HashMap::new();
        for action in actions.iter() {
            let id = action.resolved_id();
            order.retain(|existing| *existing != id);
            order.push(id.clone());
            latest.insert(id, action.clone());
        }

        let backup = self.reserve_backup_path()?;
        fs::copy(&self.queue_path, &backup).map_err(|e| ControlsError::io(&backup, e))?;

        let mut body = String::new();
        for id in &order {
            if let Some(action) = latest.get(id) {
                let line = serde_json::to_string(action)
                    .map_err(|e| ControlsError::json(&self.queue_path, e))?;
                body.push_str(&line);
                body.push('\n');
            }
        }
        fs::write(&self.queue_path, body).map_err(|e| ControlsError::io(&self.queue_path, e))?;

        let report = PruneReport {
            kept: order.len(),
            removed: actions.len() - order.len(),
            backup: Some(backup),
        };
        info!(kept = report.kept, removed = report.removed, "Pruned deferred queue");
        Ok(report)
    }

    /// Claims a fresh `<file>.bak_<timestamp>[_n]` name so back-to-back
    /// prunes never overwrite an earlier backup.
    fn reserve_backup_path(&self) -> Result<PathBuf> {
        let file_name = self
            .queue_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem = format!("{file_name}.bak_{}", file_timestamp());
        for attempt in 0u32.. {
            let name = if attempt == 0 {
                stem.clone()
            } else {
                format!("{stem}_{attempt}")
            };
            let candidate = self.queue_path.with_file_name(name);
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(_) => return Ok(candidate),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(ControlsError::io(&candidate, e)),
            }
        }
        Err(ControlsError::Execution("no free backup name".to_string()))
    }

    pub fn queue_summary(&self) -> QueueSummary {
        let raw = fs::read_to_string(&self.queue_path).ok();
        let exists = raw.is_some();
        let raw = raw.unwrap_or_default();
        let lines = raw.lines().filter(|l| !l.trim().is_empty()).count();
        let actions: Vec<DeferredAction> = raw.lines().filter_map(parse_line).collect();
        let unique_ids = actions
            .iter()
            .map(DeferredAction::resolved_id)
            .collect::<HashSet<_>>()
            .len();
        QueueSummary {
            path: self.queue_path.clone(),
            exists,
            lines,
            parsed: actions.len(),
            unique_ids,
        }
    }
}

/// Parses one log line. Blank, malformed or non-object lines and entries
/// whose `cmd` is not a list of strings are skipped.
fn parse_line(line: &str) -> Option<DeferredAction> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(line).ok()?;
    serde_json::from_value(value).ok()
}

pub(crate) fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ControlsError::io(parent, e))?;
    }
    let line = serde_json::to_string(value).map_err(|e| ControlsError::json(path, e))?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ControlsError::io(path, e))?;
    writeln!(file, "{line}").map_err(|e| ControlsError::io(path, e))
}
