use async_trait::async_trait;
use deskpilot::config::DeferredConfig;
use deskpilot::deferred::{
    action_id, done_marker_path, EnqueueDisposition, EnqueueRequest, ExecuteOptions,
    ExecutionGuard, PendingFilter,
};
use deskpilot::{CommandOutput, CommandRunner, DeferredQueue, Paths, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tempfile::TempDir;

fn cmd(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|s| s.to_string()).collect()
}

fn request(name: &str, run_id: &str) -> EnqueueRequest {
    EnqueueRequest {
        name: name.to_string(),
        cmd: cmd(&["python", &format!("{name}.py")]),
        cwd: String::new(),
        reason: "controls_state.paused".to_string(),
        run_id: run_id.to_string(),
    }
}

/// Returns success for every command except those whose first token is listed.
#[derive(Default)]
struct ScriptedRunner {
    failing: HashSet<String>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, cmd: &[String], _cwd: &Path) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(cmd.to_vec());
        let fails = cmd.iter().any(|t| self.failing.contains(t));
        Ok(CommandOutput {
            exit_status: Some(if fails { 1 } else { 0 }),
            stdout: format!("ran {}", cmd.join(" ")),
            stderr: if fails { "boom".into() } else { String::new() },
            seconds: 0.01,
        })
    }
}

struct Open;

impl ExecutionGuard for Open {
    fn blocked(&self) -> Option<String> {
        None
    }
}

/// Allows a fixed number of checks, then blocks.
struct Budget(Mutex<usize>);

impl ExecutionGuard for Budget {
    fn blocked(&self) -> Option<String> {
        let mut left = self.0.lock().unwrap();
        if *left == 0 {
            Some("controls_state.paused".to_string())
        } else {
            *left -= 1;
            None
        }
    }
}

fn live(max: usize) -> ExecuteOptions {
    ExecuteOptions {
        filter: PendingFilter::default(),
        max,
        live: true,
    }
}

#[test]
fn test_enqueue_twice_within_window_appends_once() {
    let dir = TempDir::new().unwrap();
    let queue = DeferredQueue::open(&Paths::new(dir.path()), DeferredConfig::default());

    let first = queue.enqueue(&request("click", "run_a")).unwrap();
    let second = queue.enqueue(&request("click", "run_b")).unwrap();
    assert_eq!(first.disposition, EnqueueDisposition::Appended);
    assert_eq!(second.disposition, EnqueueDisposition::SuppressedQueued);
    assert_eq!(first.id, second.id);

    let pending = queue.list_pending(&PendingFilter::default()).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].queued_count, 1);
}

#[test]
fn test_dedupe_survives_restart() {
    let dir = TempDir::new().unwrap();
    let paths = Paths::new(dir.path());
    DeferredQueue::open(&paths, DeferredConfig::default())
        .enqueue(&request("click", "run_a"))
        .unwrap();

    let reopened = DeferredQueue::open(&paths, DeferredConfig::default());
    let again = reopened.enqueue(&request("click", "run_b")).unwrap();
    assert_eq!(again.disposition, EnqueueDisposition::SuppressedQueued);
}

#[test]
fn test_done_marker_suppresses_within_cooldown() {
    let dir = TempDir::new().unwrap();
    let paths = Paths::new(dir.path());
    let queue = DeferredQueue::open(&paths, DeferredConfig::default());
    let req = request("click", "");
    let id = action_id(&req.name, &req.cmd);

    fs::create_dir_all(paths.deferred_done_dir()).unwrap();
    fs::write(done_marker_path(&paths.deferred_done_dir(), &id, ""), "{}").unwrap();

    let outcome = queue.enqueue(&req).unwrap();
    assert_eq!(outcome.disposition, EnqueueDisposition::SuppressedDone);
    assert!(queue.list_pending(&PendingFilter::default()).unwrap().is_empty());
    assert!(!paths.deferred_queue().exists());
}

#[test]
fn test_expired_cooldown_allows_requeue() {
    let dir = TempDir::new().unwrap();
    let paths = Paths::new(dir.path());
    let cfg = DeferredConfig {
        done_cooldown_s: 0.0,
        ..DeferredConfig::default()
    };
    let queue = DeferredQueue::open(&paths, cfg);
    let req = request("click", "");
    let id = action_id(&req.name, &req.cmd);
    fs::create_dir_all(paths.deferred_done_dir()).unwrap();
    fs::write(done_marker_path(&paths.deferred_done_dir(), &id, ""), "{}").unwrap();

    let later = deskpilot::utils::now_epoch() + 5.0;
    let outcome = queue.enqueue_at(&req, later).unwrap();
    assert_eq!(outcome.disposition, EnqueueDisposition::Appended);
}

#[test]
fn test_list_pending_keeps_latest_and_counts() {
    let dir = TempDir::new().unwrap();
    let paths = Paths::new(dir.path());
    fs::create_dir_all(paths.actions_dir()).unwrap();
    let lines = [
        r#"{"name": "a", "cmd": ["x"], "run_id": "r1", "reason": "first"}"#,
        r#"{"name": "b", "cmd": ["y"], "run_id": "r1"}"#,
        r#"not json"#,
        r#"{"name": "a", "cmd": ["x"], "run_id": "r2", "reason": "second"}"#,
        r#"{"name": "c", "cmd": "not-a-list"}"#,
    ];
    fs::write(paths.deferred_queue(), lines.join("\n")).unwrap();
    let queue = DeferredQueue::open(&paths, DeferredConfig::default());

    let pending = queue.list_pending(&PendingFilter::default()).unwrap();
    let names: Vec<&str> = pending.iter().map(|p| p.action.name.as_str()).collect();
    assert_eq!(names, vec!["b", "a"]);
    assert_eq!(pending[1].action.reason, "second");
    assert_eq!(pending[1].queued_count, 2);
    assert_eq!(pending[1].action.id, action_id("a", &cmd(&["x"])));

    let all = queue
        .list_pending(&PendingFilter {
            all: true,
            ..PendingFilter::default()
        })
        .unwrap();
    assert_eq!(all.len(), 3);

    let per_run = queue
        .list_pending(&PendingFilter {
            run_ids: vec!["r1".into()],
            ..PendingFilter::default()
        })
        .unwrap();
    assert_eq!(per_run.len(), 2);
    assert!(per_run.iter().all(|p| p.action.run_id == "r1"));
}

#[tokio::test]
async fn test_dry_run_executes_nothing() {
    let dir = TempDir::new().unwrap();
    let queue = DeferredQueue::open(&Paths::new(dir.path()), DeferredConfig::default());
    queue.enqueue(&request("a", "r")).unwrap();
    let runner = ScriptedRunner::default();

    let report = queue
        .execute_pending(&ExecuteOptions { max: 10, ..ExecuteOptions::default() }, &Open, &runner)
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.pending.len(), 1);
    assert_eq!(report.attempted, 0);
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_execute_stops_at_first_failure_and_marks_done() {
    let dir = TempDir::new().unwrap();
    let paths = Paths::new(dir.path());
    let queue = DeferredQueue::open(&paths, DeferredConfig::default());
    for name in ["a", "b", "c"] {
        queue.enqueue(&request(name, "")).unwrap();
    }
    let runner = ScriptedRunner::failing(&["b.py"]);

    let report = queue.execute_pending(&live(10), &Open, &runner).await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.results.len(), 2);
    assert!(report.results[0].ok);
    assert!(!report.results[1].ok);
    assert!(report.failed());
    assert!(report.stopped.as_deref().unwrap().starts_with("action_failed:"));
    assert_eq!(runner.calls().len(), 2);

    let done = paths.deferred_done_dir();
    for name in ["a", "b"] {
        let req = request(name, "");
        assert!(done_marker_path(&done, &action_id(&req.name, &req.cmd), "").exists());
    }
    let results = fs::read_to_string(paths.deferred_results()).unwrap();
    assert_eq!(results.lines().count(), 2);

    let remaining = queue.list_pending(&PendingFilter::default()).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].action.name, "c");
}

#[tokio::test]
async fn test_guard_is_rechecked_before_each_action() {
    let dir = TempDir::new().unwrap();
    let queue = DeferredQueue::open(&Paths::new(dir.path()), DeferredConfig::default());
    for name in ["a", "b", "c"] {
        queue.enqueue(&request(name, "")).unwrap();
    }
    let runner = ScriptedRunner::default();
    let guard = Budget(Mutex::new(1));

    let report = queue.execute_pending(&live(10), &guard, &runner).await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.stopped.as_deref(), Some("controls_state.paused"));
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn test_max_bounds_attempts_and_per_run_markers() {
    let dir = TempDir::new().unwrap();
    let paths = Paths::new(dir.path());
    let queue = DeferredQueue::open(&paths, DeferredConfig::default());
    queue.enqueue(&request("a", "run 1")).unwrap();
    queue.enqueue(&request("b", "run 1")).unwrap();
    let runner = ScriptedRunner::default();

    let options = ExecuteOptions {
        filter: PendingFilter {
            run_ids: vec!["run 1".into()],
            ..PendingFilter::default()
        },
        max: 1,
        live: true,
    };
    let report = queue.execute_pending(&options, &Open, &runner).await.unwrap();
    assert_eq!(report.attempted, 1);

    let req = request("a", "run 1");
    let id = action_id(&req.name, &req.cmd);
    assert!(done_marker_path(&paths.deferred_done_dir(), &id, "run 1").exists());
    assert!(!done_marker_path(&paths.deferred_done_dir(), &id, "").exists());
}

#[test]
fn test_prune_keeps_latest_per_id_with_backup() {
    let dir = TempDir::new().unwrap();
    let paths = Paths::new(dir.path());
    fs::create_dir_all(paths.actions_dir()).unwrap();
    let lines = [
        r#"{"name": "a", "cmd": ["x"], "run_id": "r1"}"#,
        r#"{"name": "b", "cmd": ["y"], "run_id": "r1"}"#,
        r#"{"name": "a", "cmd": ["x"], "run_id": "r2"}"#,
    ];
    let original = lines.join("\n") + "\n";
    fs::write(paths.deferred_queue(), &original).unwrap();
    let queue = DeferredQueue::open(&paths, DeferredConfig::default());

    let report = queue.prune().unwrap();
    assert_eq!(report.kept, 2);
    assert_eq!(report.removed, 1);
    let backup = report.backup.unwrap();
    assert_eq!(fs::read_to_string(backup).unwrap(), original);

    let pruned = fs::read_to_string(paths.deferred_queue()).unwrap();
    let kept: Vec<serde_json::Value> = pruned
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0]["name"], "b");
    assert_eq!(kept[1]["name"], "a");
    assert_eq!(kept[1]["run_id"], "r2");
}

#[test]
fn test_prune_without_queue_is_noop() {
    let dir = TempDir::new().unwrap();
    let queue = DeferredQueue::open(&Paths::new(dir.path()), DeferredConfig::default());
    let report = queue.prune().unwrap();
    assert_eq!(report.kept, 0);
    assert!(report.backup.is_none());
}

#[tokio::test]
async fn test_marker_from_another_run_counts_as_done() {
    let dir = TempDir::new().unwrap();
    let paths = Paths::new(dir.path());
    let queue = DeferredQueue::open(&paths, DeferredConfig::default());
    let first = queue.enqueue(&request("click", "r1")).unwrap();
    assert_eq!(first.disposition, EnqueueDisposition::Appended);

    let options = ExecuteOptions {
        filter: PendingFilter {
            run_ids: vec!["r1".into()],
            ..PendingFilter::default()
        },
        max: 10,
        live: true,
    };
    let runner = ScriptedRunner::default();
    queue.execute_pending(&options, &Open, &runner).await.unwrap();
    assert!(done_marker_path(&paths.deferred_done_dir(), &first.id, "r1").exists());

    let second = queue.enqueue(&request("click", "r2")).unwrap();
    assert_eq!(second.disposition, EnqueueDisposition::SuppressedDone);
    assert!(queue.list_pending(&PendingFilter::default()).unwrap().is_empty());

    let reopened = DeferredQueue::open(&paths, DeferredConfig::default());
    let third = reopened.enqueue(&request("click", "r3")).unwrap();
    assert_eq!(third.disposition, EnqueueDisposition::SuppressedDone);
    assert_eq!(runner.calls().len(), 1);
}

#[test]
fn test_back_to_back_prunes_keep_every_backup() {
    let dir = TempDir::new().unwrap();
    let paths = Paths::new(dir.path());
    fs::create_dir_all(paths.actions_dir()).unwrap();
    let lines = [
        r#"{"name": "a", "cmd": ["x"], "run_id": "r1"}"#,
        r#"{"name": "a", "cmd": ["x"], "run_id": "r2"}"#,
    ];
    let original = lines.join("\n") + "\n";
    fs::write(paths.deferred_queue(), &original).unwrap();
    let queue = DeferredQueue::open(&paths, DeferredConfig::default());

    let first = queue.prune().unwrap().backup.unwrap();
    let second = queue.prune().unwrap().backup.unwrap();
    assert_ne!(first, second);
    assert_eq!(fs::read_to_string(&first).unwrap(), original);
    assert_eq!(fs::read_to_string(&second).unwrap().lines().count(), 1);
}
