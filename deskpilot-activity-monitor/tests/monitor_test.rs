use deskpilot::config::UserActivityConfig;
use deskpilot::utils::now_epoch;
use deskpilot::workflow::Interrupt;
use deskpilot::{
    ControlState, MemoryStateStore, PauseController, ResumeChoice, ResumeKind, ResumePrompt,
    StatePatch, StateStore,
};
use deskpilot_activity_monitor::{
    run_monitor, ActivityLog, ActivityMonitor, InputEvent, LoopOptions, MonitorError,
    MonitorState, RawInput, Transition,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Fixture {
    _dir: TempDir,
    store: Arc<MemoryStateStore>,
    log: ActivityLog,
    monitor: ActivityMonitor,
    t0: f64,
}

fn fixture(config: UserActivityConfig) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStateStore::new());
    let log = ActivityLog::new(dir.path().join("logs/actions/user_activity_events.jsonl"));
    let t0 = now_epoch();
    // 96 DPI with 2.54 cm makes the mouse threshold exactly 96 px.
    let config = UserActivityConfig {
        mouse_cm_threshold: 2.54,
        ..config
    };
    let monitor = ActivityMonitor::new(
        PauseController::new(store.clone()),
        config,
        96.0,
        false,
        log.clone(),
        t0,
    );
    Fixture {
        _dir: dir,
        store,
        log,
        monitor,
        t0,
    }
}

struct Answer(ResumeChoice);

impl ResumePrompt for Answer {
    fn ask(&mut self, _state: &ControlState, _default_minutes: u32) -> ResumeChoice {
        self.0
    }
}

#[test]
fn test_mouse_travel_pauses_and_logs() {
    let mut fx = fixture(UserActivityConfig::default());
    assert_eq!(fx.monitor.handle(RawInput::MouseMove { x: 0.0, y: 0.0 }, fx.t0), None);
    assert_eq!(fx.monitor.handle(RawInput::MouseMove { x: 60.0, y: 0.0 }, fx.t0), None);
    let transition = fx
        .monitor
        .handle(RawInput::MouseMove { x: 60.0, y: 40.0 }, fx.t0 + 0.1);
    assert_eq!(
        transition,
        Some(Transition::Paused(InputEvent::Mouse { distance_px: 40.0 }))
    );
    assert_eq!(fx.monitor.state(), MonitorState::Paused);

    let st = fx.store.read();
    assert!(st.paused());
    assert_eq!(st.paused_by(), "user_activity");
    assert_eq!(st.paused_reason(), "user_activity");
    assert_eq!(st.get("paused_event").unwrap()["type"], "mouse");

    let entries = fx.log.read_all();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].paused);
    assert_eq!(entries[0].event["distance_px"], 40.0);
}

#[test]
fn test_owner_exception_only_lets_esc_through() {
    let mut fx = fixture(UserActivityConfig::default());
    fx.store.write(&StatePatch::new().owner("workflow_test"));

    assert_eq!(fx.monitor.handle(RawInput::key("KeyA"), fx.t0), None);
    fx.monitor.handle(RawInput::MouseMove { x: 0.0, y: 0.0 }, fx.t0);
    assert_eq!(fx.monitor.handle(RawInput::MouseMove { x: 500.0, y: 0.0 }, fx.t0), None);
    assert!(!fx.store.read().paused());

    assert!(matches!(
        fx.monitor.handle(RawInput::esc(), fx.t0),
        Some(Transition::Paused(_))
    ));
    assert!(fx.store.read().paused());
}

#[test]
fn test_input_while_paused_only_refreshes_quiet_timer() {
    let mut fx = fixture(UserActivityConfig::default());
    fx.monitor.handle(RawInput::key("KeyQ"), fx.t0);

    assert_eq!(fx.monitor.handle(RawInput::esc(), fx.t0 + 15.0), None);
    assert!(fx.store.read().paused());
    assert_eq!(fx.monitor.last_input(), fx.t0 + 15.0);

    // 25s after the pause, but only 10s after the latest input.
    assert_eq!(fx.monitor.tick(fx.t0 + 25.0), None);
    assert!(fx.store.read().paused());

    assert_eq!(
        fx.monitor.tick(fx.t0 + 36.0),
        Some(Transition::Resumed(ResumeKind::Idle))
    );
    let st = fx.store.read();
    assert!(!st.paused());
    assert_eq!(st.paused_by(), "");
    assert_eq!(fx.monitor.state(), MonitorState::Idle);
    assert_eq!(fx.log.read_all().last().unwrap().event["type"], "auto_resume_idle");
}

#[test]
fn test_scheduled_resume_takes_precedence_and_needs_quiet() {
    let mut fx = fixture(UserActivityConfig::default());
    fx.monitor.handle(RawInput::key("KeyQ"), fx.t0);
    PauseController::new(fx.store.clone()).schedule_resume_at(fx.t0 + 60.0);

    // Idle threshold passed, but a scheduled resume suppresses the idle path.
    assert_eq!(fx.monitor.tick(fx.t0 + 30.0), None);

    fx.monitor.handle(RawInput::key("KeyW"), fx.t0 + 59.0);
    assert_eq!(fx.monitor.tick(fx.t0 + 61.0), None, "input 2s ago is not quiet");
    assert_eq!(
        fx.monitor.tick(fx.t0 + 62.5),
        Some(Transition::Resumed(ResumeKind::Scheduled))
    );
    let st = fx.store.read();
    assert!(!st.paused());
    assert_eq!(st.resume_at(), None);
    assert_eq!(fx.log.read_all().last().unwrap().event["type"], "auto_resume_at");
}

#[test]
fn test_manual_pause_is_never_auto_resumed() {
    let mut fx = fixture(UserActivityConfig::default());
    PauseController::new(fx.store.clone()).pause("maintenance", "cli", None);
    assert_eq!(fx.monitor.tick(fx.t0 + 3600.0), None);
    assert!(fx.store.read().paused());
    assert_eq!(fx.monitor.state(), MonitorState::Idle);
}

#[test]
fn test_prompt_schedules_resume() {
    let mut fx = fixture(UserActivityConfig::default());
    fx.monitor.handle(RawInput::esc(), fx.t0);
    let before = now_epoch();
    let choice = fx
        .monitor
        .prompt_resume(&mut Answer(ResumeChoice::ResumeIn { minutes: 5 }));
    assert_eq!(choice, ResumeChoice::ResumeIn { minutes: 5 });
    let resume_at = fx.store.read().resume_at().unwrap();
    assert!(resume_at >= before + 300.0 && resume_at < before + 310.0);
    assert_eq!(fx.monitor.state(), MonitorState::Paused);

    fx.monitor
        .prompt_resume(&mut Answer(ResumeChoice::ResumeNow));
    assert!(!fx.store.read().paused());
    assert_eq!(fx.monitor.state(), MonitorState::Idle);
}

#[tokio::test]
async fn test_loop_once_returns_after_first_pause() {
    let mut fx = fixture(UserActivityConfig::default());
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(RawInput::MouseMove { x: 0.0, y: 0.0 }).unwrap();
    tx.send(RawInput::key("KeyA")).unwrap();
    tx.send(RawInput::esc()).unwrap();

    let options = LoopOptions {
        once: true,
        poll_interval: Duration::from_millis(10),
        ..LoopOptions::default()
    };
    let report = run_monitor(&mut fx.monitor, rx, None, &options, &Interrupt::new())
        .await
        .unwrap();
    assert_eq!(report.events, 1, "the first mouse sample only sets the origin");
    assert_eq!(report.pauses, 1);
    assert!(fx.store.read().paused());
    drop(tx);
}

#[tokio::test]
async fn test_loop_reports_closed_listener() {
    let mut fx = fixture(UserActivityConfig::default());
    let (tx, rx) = mpsc::unbounded_channel::<RawInput>();
    drop(tx);
    let result = run_monitor(
        &mut fx.monitor,
        rx,
        None,
        &LoopOptions::default(),
        &Interrupt::new(),
    )
    .await;
    assert!(matches!(result, Err(MonitorError::Listener(_))));
}

#[tokio::test]
async fn test_loop_stops_on_shutdown() {
    let mut fx = fixture(UserActivityConfig::default());
    let (_tx, rx) = mpsc::unbounded_channel::<RawInput>();
    let shutdown = Interrupt::new();
    shutdown.trigger();
    let report = run_monitor(&mut fx.monitor, rx, None, &LoopOptions::default(), &shutdown)
        .await
        .unwrap();
    assert_eq!(report.events, 0);
}
