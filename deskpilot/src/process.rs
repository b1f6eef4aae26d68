//! Subprocess execution behind a trait so queue and runner logic can be
//! driven by a scripted double in tests.

use crate::errors::{ControlsError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tracing::debug;

/// Exit code recorded for a command cut short by Ctrl+C.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub seconds: f64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// Exit status flattened to a single code; signals map to -1.
    pub fn returncode(&self) -> i32 {
        self.exit_status.unwrap_or(-1)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `cmd[0]` with `cmd[1..]` as arguments in `cwd`, capturing output.
    ///
    /// Dropping the returned future must terminate the child.
    async fn run(&self, cmd: &[String], cwd: &Path) -> Result<CommandOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cmd: &[String], cwd: &Path) -> Result<CommandOutput> {
        let (program, args) = cmd
            .split_first()
            .ok_or_else(|| ControlsError::InvalidArgument("empty command".to_string()))?;

        debug!(program = %program, ?args, cwd = %cwd.display(), "Spawning command");
        let started = Instant::now();
        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ControlsError::Execution(format!("failed to run '{program}': {e}")))?;

        Ok(CommandOutput {
            exit_status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            seconds: round_seconds(started.elapsed().as_secs_f64()),
        })
    }
}

pub(crate) fn round_seconds(seconds: f64) -> f64 {
    (seconds * 100.0).round() / 100.0
}
