//! User-activity interrupt monitor.
//!
//! Watches global keyboard and mouse input and pauses desktop automation
//! through the shared controls state as soon as a human takes over: ESC
//! always, other keys and sustained pointer travel depending on policy.
//! Pauses it caused are lifted again by the scheduled or idle auto-resume
//! paths of [`deskpilot::PauseController`].

pub mod dpi;
pub mod error;
pub mod events;
pub mod listener;
pub mod monitor;
pub mod prompt;

pub use dpi::{cm_to_px, detect_dpi, resolve_dpi};
pub use error::{MonitorError, Result};
pub use events::{ActivityLog, ActivityLogEntry, InputEvent, RawInput};
pub use listener::{run_monitor, spawn_input_listener, LoopOptions, LoopReport};
pub use monitor::{
    evaluate, ActivityMonitor, ActivityPolicy, IgnoreReason, MonitorState, MouseAccumulator,
    Transition, Verdict,
};
pub use prompt::TerminalPrompt;
