//! Global input capture and the monitor's event loop.

use crate::error::{MonitorError, Result};
use crate::events::RawInput;
use crate::monitor::{ActivityMonitor, Transition};
use deskpilot::utils::now_epoch;
use deskpilot::workflow::Interrupt;
use deskpilot::{PolicyRules, ResumePrompt};
use rdev::{EventType, Key};
use serde::Serialize;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Starts the OS-level keyboard/mouse hook on its own thread.
///
/// The hook blocks forever; when it fails the sender is dropped and the
/// receiving loop sees the channel close.
pub fn spawn_input_listener() -> (thread::JoinHandle<()>, UnboundedReceiver<RawInput>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = thread::spawn(move || listen(tx));
    (handle, rx)
}

fn listen(tx: UnboundedSender<RawInput>) {
    if let Err(error) = rdev::listen(move |event: rdev::Event| {
        let raw = match event.event_type {
            EventType::KeyPress(Key::Escape) => RawInput::esc(),
            EventType::KeyPress(key) => RawInput::key(format!("{key:?}")),
            EventType::MouseMove { x, y } => RawInput::MouseMove { x, y },
            _ => return,
        };
        if tx.send(raw).is_err() {
            debug!("Activity loop gone; dropping input event");
        }
    }) {
        error!("Global input listener failed: {:?}", error);
    }
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub poll_interval: Duration,
    /// Return after the first pause.
    pub once: bool,
    /// Re-read `user_activity` settings from this file on every event.
    pub live_config: Option<PathBuf>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            once: false,
            live_config: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopReport {
    pub events: usize,
    pub pauses: usize,
    pub resumes: usize,
}

/// Drives `monitor` from `rx` until `shutdown` fires, the input channel
/// closes, or (with `once`) the first pause.
///
/// Events reset the quiet timer; every poll interval without events runs
/// the auto-resume check. The prompt, when given, blocks the loop while it
/// waits for an answer, so it needs a multi-threaded runtime.
pub async fn run_monitor(
    monitor: &mut ActivityMonitor,
    mut rx: UnboundedReceiver<RawInput>,
    mut prompt: Option<&mut (dyn ResumePrompt + '_)>,
    options: &LoopOptions,
    shutdown: &Interrupt,
) -> Result<LoopReport> {
    let mut report = LoopReport::default();
    let mut ticker = tokio::time::interval(options.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("User activity monitor running");

    loop {
        tokio::select! {
            _ = shutdown.triggered() => {
                info!("Activity monitor stopping");
                return Ok(report);
            }
            raw = rx.recv() => {
                let Some(raw) = raw else {
                    return Err(MonitorError::Listener("input channel closed".to_string()));
                };
                let Some(event) = monitor.observe(raw) else {
                    continue;
                };
                report.events += 1;
                if let Some(path) = &options.live_config {
                    monitor.update_config(PolicyRules::load(path).user_activity);
                }
                if let Some(Transition::Paused(_)) = monitor.handle_event(event, now_epoch()) {
                    report.pauses += 1;
                    if let Some(prompt) = prompt.as_deref_mut() {
                        let choice = tokio::task::block_in_place(|| monitor.prompt_resume(prompt));
                        debug!(?choice, "Resume prompt answered");
                    }
                    if options.once {
                        return Ok(report);
                    }
                }
            }
            _ = ticker.tick() => {
                if let Some(Transition::Resumed(kind)) = monitor.tick(now_epoch()) {
                    info!(%kind, "Automation auto-resumed");
                    report.resumes += 1;
                }
            }
        }
    }
}
