//! deskpilot CLI
//!
//! Operator front-end for the shared desktop controls: inspect and edit the
//! lease and pause flag, manage the deferred-action queue, run workflows and
//! the user-activity monitor.
//!
//! Usage from a workspace root:
//!   deskpilot inspect                       # Show controls state
//!   deskpilot gate --owner workflow_test    # Exit 2 when denied
//!   deskpilot pause --reason meeting        # Pause all automation
//!   deskpilot deferred list                 # What is waiting to run
//!   deskpilot deferred run --live           # Replay deferred actions
//!   deskpilot workflow run plan.yaml        # Run a workflow plan
//!   deskpilot monitor                       # Pause on user input

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use deskpilot::deferred::{ExecuteOptions, PendingFilter};
use deskpilot::maintenance::{self, ResetOptions};
use deskpilot::pause::clamp_resume_minutes;
use deskpilot::store::age_seconds;
use deskpilot::utils::now_epoch;
use deskpilot::workflow::{Interrupt, RunOptions};
use deskpilot::{
    is_stale, Paths, ProcessRunner, ReleaseOutcome, ReleaseRequest, ResumePrompt, WorkflowPlan,
    Workspace,
};
use deskpilot_activity_monitor::{
    resolve_dpi, run_monitor, spawn_input_listener, ActivityLog, ActivityMonitor, LoopOptions,
    TerminalPrompt,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

mod display;
mod logging;

/// Exit status for a refused gate check or release.
const EXIT_DENIED: i32 = 2;

#[derive(Parser)]
#[command(name = "deskpilot")]
#[command(about = "Coordinate desktop automation with the humans using the desktop")]
#[command(version)]
struct Cli {
    /// Workspace root holding config/ and logs/
    #[arg(long, global = true, env = "DESKPILOT_ROOT")]
    root: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the controls state, staleness, emergency stop and agent mode
    Inspect,
    /// Ask whether an owner may drive input right now
    Gate(GateArgs),
    /// Pause all automation
    Pause(PauseArgs),
    /// Lift the pause and its scheduled resume
    Unpause {
        #[arg(long, default_value = "manual_unpause")]
        reason: String,
    },
    /// Resume automatically after N minutes (1-120)
    ScheduleResume {
        #[arg(long, short)]
        minutes: u32,
    },
    /// Clear the lease owner without touching the pause flag
    ReleaseOwner(ReleaseArgs),
    /// Global kill switch checked before anything else
    #[command(subcommand)]
    EmergencyStop(EmergencyCommands),
    /// Inspect and replay deferred interactive actions
    #[command(subcommand)]
    Deferred(DeferredCommands),
    /// Run workflow plans
    #[command(subcommand)]
    Workflow(WorkflowCommands),
    /// Report effective settings and problems before a run
    Preflight(PreflightArgs),
    /// Clear leftover lease/pause state
    Reset(ResetArgs),
    /// Pause automation when the user touches keyboard or mouse
    Monitor(MonitorArgs),
}

#[derive(Args, Debug)]
struct GateArgs {
    /// Owner asking for the controls (defaults to the workflow owner)
    #[arg(long)]
    owner: Option<String>,
    #[arg(long)]
    stale_seconds: Option<f64>,
    /// Also apply the in-control-window check
    #[arg(long)]
    actuate: bool,
}

#[derive(Args, Debug)]
struct PauseArgs {
    #[arg(long, default_value = "manual")]
    reason: String,
    #[arg(long = "by", default_value = "cli")]
    paused_by: String,
}

#[derive(Args, Debug)]
struct ReleaseArgs {
    /// Only release when this is the current owner
    #[arg(long, required_unless_present = "force")]
    if_owner: Option<String>,
    /// Release whoever owns the controls
    #[arg(long)]
    force: bool,
    /// Only release when the state is older than this many seconds
    #[arg(long, default_value_t = 0.0)]
    stale_seconds: f64,
}

#[derive(Subcommand)]
enum EmergencyCommands {
    Set {
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    Clear,
    Status,
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// Restrict to these action ids
    #[arg(long = "id")]
    ids: Vec<String>,
    /// Restrict to these run ids (implies per-run done markers)
    #[arg(long = "run-id")]
    run_ids: Vec<String>,
    /// Track completion per run instead of globally
    #[arg(long)]
    per_run: bool,
    /// Ignore done markers
    #[arg(long)]
    force: bool,
    /// List every queued line without de-duplication
    #[arg(long)]
    all: bool,
}

impl FilterArgs {
    fn to_filter(&self) -> PendingFilter {
        PendingFilter {
            ids: self.ids.clone(),
            run_ids: self.run_ids.clone(),
            per_run: self.per_run,
            force: self.force,
            all: self.all,
        }
    }
}

#[derive(Subcommand)]
enum DeferredCommands {
    List(FilterArgs),
    Run {
        #[command(flatten)]
        filter: FilterArgs,
        /// Maximum actions to attempt (defaults to deferred.max_per_run)
        #[arg(long)]
        max: Option<usize>,
        /// Actually execute; without it this is a dry run
        #[arg(long)]
        live: bool,
        /// Owner identity used for the safety re-check
        #[arg(long)]
        owner: Option<String>,
    },
    /// Keep only the latest line per action id (backs up the log first)
    Prune,
}

#[derive(Subcommand)]
enum WorkflowCommands {
    Run(WorkflowRunArgs),
}

#[derive(Args, Debug)]
struct WorkflowRunArgs {
    /// Plan file (.json, .yaml or .yml)
    plan: PathBuf,
    /// Override the plan's lease owner
    #[arg(long)]
    owner: Option<String>,
    /// Clear a stale owner before starting
    #[arg(long)]
    reset: bool,
    #[arg(long)]
    force_clear_owner: bool,
    /// Unpause when the reset policy allows it
    #[arg(long)]
    auto_unpause: bool,
    #[arg(long)]
    force_unpause: bool,
}

impl WorkflowRunArgs {
    fn reset_options(&self) -> Option<ResetOptions> {
        let options = ResetOptions {
            force_clear_owner: self.force_clear_owner,
            auto_unpause: self.auto_unpause,
            force_unpause: self.force_unpause,
            ..ResetOptions::default()
        };
        (self.reset || !options.is_noop()).then_some(options)
    }
}

#[derive(Args, Debug)]
struct PreflightArgs {
    /// Also write the report to this file
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    stale_seconds: Option<f64>,
}

#[derive(Args, Debug)]
struct ResetArgs {
    #[arg(long)]
    force_clear_owner: bool,
    #[arg(long)]
    auto_unpause: bool,
    #[arg(long)]
    force_unpause: bool,
    /// Rewrite the state so its timestamp is fresh
    #[arg(long)]
    refresh: bool,
    #[arg(long)]
    dry_run: bool,
    /// Report path (defaults to logs/tests/workflow_reset_<ts>.json)
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct MonitorArgs {
    /// Only ESC pauses; other keys and the mouse are ignored
    #[arg(long)]
    esc_only: bool,
    /// Exit after the first pause
    #[arg(long)]
    once: bool,
    /// Ask how to resume after each pause
    #[arg(long, conflicts_with = "no_popup")]
    popup: bool,
    #[arg(long)]
    no_popup: bool,
}

#[derive(Serialize)]
struct InspectReport {
    root: PathBuf,
    controls_state: deskpilot::ControlState,
    stale: bool,
    age_s: Option<f64>,
    stale_after_s: f64,
    emergency_stop: deskpilot::EmergencyStopStatus,
    agent_mode: deskpilot::AgentMode,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let root = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };
    // Logging first so policy warnings from opening the workspace are kept.
    let _guard = logging::init_logging(&Paths::new(root.clone()).tool_log_dir())?;
    let workspace = Workspace::open(root);

    let code = run(cli, workspace).await?;
    Ok(exit_code(code))
}

/// Returning the status from `main` lets the log writer guard flush on drop.
fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map(ExitCode::from).unwrap_or(ExitCode::FAILURE)
}

async fn run(cli: Cli, ws: Workspace) -> Result<i32> {
    let json = cli.json;
    match cli.command {
        Commands::Inspect => inspect(&ws, json),
        Commands::Gate(args) => gate(&ws, &args, json),
        Commands::Pause(args) => {
            let state = ws.pause_controller().pause(&args.reason, &args.paused_by, None);
            if json {
                print_json(&state)?;
            } else {
                println!("{} ({})", "Paused".yellow().bold(), args.reason);
            }
            Ok(0)
        }
        Commands::Unpause { reason } => {
            let state = ws.pause_controller().resume(&reason);
            if json {
                print_json(&state)?;
            } else {
                println!("{}", "Unpaused".green().bold());
            }
            Ok(0)
        }
        Commands::ScheduleResume { minutes } => {
            let pause = ws.pause_controller();
            if !pause.state().paused() {
                println!("Controls are not paused; nothing to schedule.");
                return Ok(0);
            }
            let resume_at = pause.schedule_resume(minutes);
            println!(
                "Resume scheduled in {} minute(s) (epoch {resume_at:.0})",
                clamp_resume_minutes(minutes)
            );
            Ok(0)
        }
        Commands::ReleaseOwner(args) => release_owner(&ws, &args),
        Commands::EmergencyStop(cmd) => emergency_stop(&ws, cmd, json),
        Commands::Deferred(cmd) => deferred(&ws, cmd, json).await,
        Commands::Workflow(WorkflowCommands::Run(args)) => workflow_run(&ws, &args, json).await,
        Commands::Preflight(args) => {
            let report = maintenance::preflight(
                ws.paths(),
                ws.rules(),
                ws.env(),
                &ws.gate(),
                &ws.deferred_queue(),
                args.stale_seconds,
            );
            if let Some(out) = &args.out {
                write_json_file(out, &report)?;
            }
            if json {
                print_json(&report)?;
            } else {
                display::preflight(&report);
            }
            Ok(0)
        }
        Commands::Reset(args) => reset(&ws, &args, json),
        Commands::Monitor(args) => monitor(&ws, &args, json).await,
    }
}

fn inspect(ws: &Workspace, json: bool) -> Result<i32> {
    let state = ws.store().read();
    let stale_after_s = ws.rules().controls.stale_after_s;
    let report = InspectReport {
        root: ws.paths().root().to_path_buf(),
        stale: is_stale(&state, stale_after_s),
        age_s: age_seconds(&state),
        stale_after_s,
        emergency_stop: ws.emergency_stop().status(),
        agent_mode: ws.agent_mode(),
        controls_state: state,
    };
    if json {
        print_json(&report)?;
        return Ok(0);
    }
    println!("Root: {}", report.root.display());
    println!("{}", serde_json::to_string_pretty(&report.controls_state)?);
    match report.age_s {
        Some(age) => println!("Age: {age:.1}s (stale: {})", report.stale),
        None => println!("Age: unknown"),
    }
    if report.emergency_stop.stopped {
        println!(
            "{} {}",
            "EMERGENCY STOP:".red().bold(),
            report.emergency_stop.reason
        );
    }
    println!("Agent mode: {}", report.agent_mode.active);
    Ok(0)
}

fn gate(ws: &Workspace, args: &GateArgs, json: bool) -> Result<i32> {
    let owner = args
        .owner
        .clone()
        .unwrap_or_else(|| ws.rules().workflow.owner.clone());
    let stale_after_s = args
        .stale_seconds
        .unwrap_or(ws.rules().controls.stale_after_s);
    let gate = ws.gate();
    let decision = if args.actuate {
        gate.may_actuate(&owner, stale_after_s)
    } else {
        gate.may_proceed(&owner, stale_after_s)
    };
    if json {
        print_json(&decision)?;
    } else {
        display::decision(&owner, &decision);
    }
    Ok(if decision.allowed { 0 } else { EXIT_DENIED })
}

fn release_owner(ws: &Workspace, args: &ReleaseArgs) -> Result<i32> {
    let request = ReleaseRequest {
        if_owner: args.if_owner.clone().unwrap_or_default(),
        force: args.force,
        stale_seconds: args.stale_seconds,
    };
    match ws.gate().release_if(&request) {
        ReleaseOutcome::Released { previous } => {
            println!("Released owner '{previous}'");
            Ok(0)
        }
        ReleaseOutcome::NotStale => {
            println!("State is not older than {}s; owner kept", args.stale_seconds);
            Ok(EXIT_DENIED)
        }
        ReleaseOutcome::OwnerMismatch { current } => {
            println!("Current owner is '{current}'; nothing released");
            Ok(EXIT_DENIED)
        }
    }
}

fn emergency_stop(ws: &Workspace, cmd: EmergencyCommands, json: bool) -> Result<i32> {
    let stop = ws.emergency_stop();
    let status = match cmd {
        EmergencyCommands::Set { reason } => stop
            .set(true, &reason)
            .context("Failed to set emergency stop")?,
        EmergencyCommands::Clear => stop
            .set(false, "")
            .context("Failed to clear emergency stop")?,
        EmergencyCommands::Status => stop.status(),
    };
    if json {
        print_json(&status)?;
    } else if status.stopped {
        println!("{} {}", "EMERGENCY STOP ACTIVE:".red().bold(), status.reason);
    } else {
        println!("{}", "Emergency stop clear".green());
    }
    Ok(0)
}

async fn deferred(ws: &Workspace, cmd: DeferredCommands, json: bool) -> Result<i32> {
    let queue = ws.deferred_queue();
    match cmd {
        DeferredCommands::List(filter) => {
            let pending = queue
                .list_pending(&filter.to_filter())
                .context("Failed to read deferred queue")?;
            if json {
                print_json(&pending)?;
            } else {
                display::pending(&pending);
            }
            Ok(0)
        }
        DeferredCommands::Run {
            filter,
            max,
            live,
            owner,
        } => {
            let owner = owner.unwrap_or_else(|| ws.rules().workflow.owner.clone());
            let options = ExecuteOptions {
                filter: filter.to_filter(),
                max: max.unwrap_or(ws.rules().deferred.max_per_run),
                live,
            };
            let guard = ws.controls_guard(&owner);
            let report = queue
                .execute_pending(&options, &guard, &ProcessRunner)
                .await
                .context("Failed to execute deferred actions")?;
            if json {
                print_json(&report)?;
            } else {
                display::execution(&report);
            }
            Ok(if report.failed() { 1 } else { 0 })
        }
        DeferredCommands::Prune => {
            let report = queue.prune().context("Failed to prune deferred queue")?;
            if json {
                print_json(&report)?;
            } else {
                println!("Kept {} line(s), removed {}", report.kept, report.removed);
                if let Some(backup) = &report.backup {
                    println!("Backup: {}", backup.display());
                }
            }
            Ok(0)
        }
    }
}

async fn workflow_run(ws: &Workspace, args: &WorkflowRunArgs, json: bool) -> Result<i32> {
    let mut plan = WorkflowPlan::load(&args.plan)
        .with_context(|| format!("Failed to load workflow plan {}", args.plan.display()))?;
    if let Some(owner) = &args.owner {
        plan.owner = Some(owner.clone());
    }

    let interrupt = Interrupt::new();
    let listener = interrupt.listen_for_ctrl_c();
    let runner = ws
        .workflow_runner(Arc::new(ProcessRunner))
        .with_interrupt(interrupt);
    let options = RunOptions {
        reset: args.reset_options(),
    };
    let outcome = runner.run(&plan, &options).await;
    listener.abort();

    if json {
        print_json(&outcome.summary)?;
    } else {
        display::workflow_outcome(&outcome);
    }
    Ok(outcome.exit_code())
}

fn reset(ws: &Workspace, args: &ResetArgs, json: bool) -> Result<i32> {
    let options = ResetOptions {
        force_clear_owner: args.force_clear_owner,
        auto_unpause: args.auto_unpause,
        force_unpause: args.force_unpause,
        refresh: args.refresh,
        dry_run: args.dry_run,
    };
    let report = maintenance::reset(&ws.gate(), &ws.pause_controller(), ws.rules(), &options);
    let path = maintenance::write_reset_report(ws.paths(), &report, args.out.as_deref())
        .context("Failed to write reset report")?;
    if json {
        print_json(&report)?;
    } else {
        display::reset(&report);
        println!("Report: {}", path.display());
    }
    Ok(0)
}

async fn monitor(ws: &Workspace, args: &MonitorArgs, json: bool) -> Result<i32> {
    let cfg = ws.rules().user_activity.clone();
    let popup = !args.no_popup && (cfg.popup_enabled || args.popup);
    let dpi = resolve_dpi(cfg.display_dpi);
    let log = ActivityLog::new(ws.paths().user_activity_events());
    let mut monitor = ActivityMonitor::new(
        ws.pause_controller(),
        cfg,
        dpi,
        args.esc_only,
        log,
        now_epoch(),
    );

    let (_listener, rx) = spawn_input_listener();
    let shutdown = Interrupt::new();
    let ctrl_c = shutdown.listen_for_ctrl_c();
    let options = LoopOptions {
        once: args.once,
        live_config: Some(ws.paths().policy_rules()),
        ..LoopOptions::default()
    };

    let mut prompt = TerminalPrompt::stdio();
    let prompt: Option<&mut dyn ResumePrompt> = if popup { Some(&mut prompt) } else { None };
    let result = run_monitor(&mut monitor, rx, prompt, &options, &shutdown).await;
    ctrl_c.abort();

    let report = result.context("Activity monitor stopped")?;
    if json {
        print_json(&report)?;
    } else {
        println!(
            "Monitor finished: {} event(s), {} pause(s), {} auto-resume(s)",
            report.events, report.pauses, report.resumes
        );
    }
    Ok(0)
}
