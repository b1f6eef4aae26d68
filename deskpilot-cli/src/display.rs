use colored::*;
use deskpilot::deferred::{ExecutionReport, PendingAction};
use deskpilot::maintenance::{PreflightReport, ResetReport};
use deskpilot::workflow::WorkflowOutcome;
use deskpilot::{Decision, RunStatus};

fn rule(ch: &str) {
    println!("{}", ch.repeat(60));
}

pub fn workflow_outcome(outcome: &WorkflowOutcome) {
    let summary = &outcome.summary;
    println!();
    rule("=");
    let headline = format!("{}: {}", summary.status, summary.plan);
    match summary.status {
        RunStatus::Pass => println!("{}", headline.green().bold()),
        RunStatus::Deferred => println!("{}", headline.yellow().bold()),
        RunStatus::Fail => println!("{}", headline.red().bold()),
    }

    rule("-");
    println!("Run: {}", summary.run_id);
    println!("   - Owner: {}", summary.lease.owner);
    println!("   - Lease acquired: {}", summary.lease.acquired);
    if let Some(reason) = &summary.lease.passive_reason {
        println!("   - Passive-only: {}", reason.yellow());
    }
    if summary.interrupted {
        println!("   - {}", "Interrupted".red());
    }

    rule("-");
    println!("Steps:");
    for step in &summary.steps {
        let mark = if step.skipped {
            "skip".dimmed()
        } else if step.deferred {
            "defer".yellow()
        } else if step.pass {
            "ok".green()
        } else {
            "FAIL".red().bold()
        };
        match (&step.defer_reason, step.returncode) {
            (Some(reason), _) => println!("   [{mark}] {} ({reason})", step.name),
            (None, Some(code)) if !step.pass => {
                println!("   [{mark}] {} (returncode {code}, {:.2}s)", step.name, step.seconds)
            }
            _ => println!("   [{mark}] {} ({:.2}s)", step.name, step.seconds),
        }
    }

    if !summary.errors.is_empty() {
        rule("-");
        println!("{}", "Errors:".red());
        for issue in &summary.errors {
            match (&issue.note, issue.count) {
                (Some(note), _) => println!("   - {}: {note}", issue.name),
                (None, Some(count)) => println!("   - {} ({count})", issue.name),
                _ => println!("   - {}", issue.name),
            }
        }
    }
    if !summary.warnings.is_empty() {
        rule("-");
        println!("{}", "Warnings:".yellow());
        for issue in &summary.warnings {
            println!("   - {}", issue.name);
        }
    }
    if !summary.recommendations.is_empty() {
        rule("-");
        println!("Recommendations:");
        for rec in &summary.recommendations {
            println!("   - {rec}");
        }
    }
    rule("=");
    if let Some(path) = &outcome.summary_path {
        println!("Summary: {}", path.display());
    }
    println!();
}

pub fn pending(items: &[PendingAction]) {
    if items.is_empty() {
        println!("No pending deferred actions.");
        return;
    }
    println!("{} pending deferred action(s):", items.len());
    for item in items {
        let action = &item.action;
        let run = if action.run_id.is_empty() { "-" } else { action.run_id.as_str() };
        println!(
            "   {} {} [run {}] x{} :: {}",
            action.id.dimmed(),
            action.name.bold(),
            run,
            item.queued_count,
            action.cmd.join(" ")
        );
        if !action.reason.is_empty() {
            println!("      reason: {}", action.reason);
        }
    }
}

pub fn execution(report: &ExecutionReport) {
    pending(&report.pending);
    if report.dry_run {
        println!("{}", "Dry run: pass --live to execute.".yellow());
        return;
    }
    for result in &report.results {
        let mark = if result.ok { "ok".green() } else { "FAIL".red().bold() };
        println!(
            "   [{mark}] {} (returncode {}, {:.2}s)",
            result.name, result.returncode, result.seconds
        );
    }
    println!("Attempted: {}", report.attempted);
    if let Some(reason) = &report.stopped {
        println!("{} {reason}", "Stopped:".yellow());
    }
}

pub fn decision(owner: &str, decision: &Decision) {
    if decision.allowed {
        println!("{} {owner} ({})", "ALLOWED".green().bold(), decision.reason);
    } else {
        println!("{} {owner} ({})", "DENIED".red().bold(), decision.reason);
    }
}

pub fn preflight(report: &PreflightReport) {
    rule("=");
    println!("Preflight {}", report.ts);
    rule("-");
    println!(
        "   - Agent mode: {} (source {:?})",
        report.agent_mode.active, report.agent_mode.source
    );
    println!(
        "   - Defer interactions in agent mode: {}",
        report.defer_interactions_when_agent_mode
    );
    println!("   - Stale after: {}s", report.stale_after_s);
    match report.controls_state_age_s {
        Some(age) => println!(
            "   - Controls state: stale={} age={age:.1}s",
            report.controls_state_stale
        ),
        None => println!("   - Controls state: no timestamp"),
    }
    println!("   - Emergency stop: {}", report.emergency_stop.stopped);
    println!(
        "   - Deferred queue: {} line(s), {} unique id(s)",
        report.deferred_queue.lines, report.deferred_queue.unique_ids
    );
    for warning in &report.warnings {
        println!("{} {warning}", "warning:".yellow());
    }
    for suggestion in &report.suggestions {
        println!("{} {suggestion}", "suggestion:".cyan());
    }
    rule("=");
}

pub fn reset(report: &ResetReport) {
    let prefix = if report.dry_run { "[dry-run] " } else { "" };
    if report.actions.is_empty() {
        println!("{prefix}Nothing to reset (stale={}).", report.stale);
        return;
    }
    for action in &report.actions {
        let line = serde_json::to_string(action).unwrap_or_else(|_| format!("{action:?}"));
        println!("{prefix}{line}");
    }
}
