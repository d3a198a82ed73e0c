//! End-of-run rendering shared by the CLI commands.

use console::style;

use crate::errors::PipelineError;
use crate::pipeline::RunReport;
use crate::sandbox::ExecutionOutcome;
use crate::ui::icons::{CHECK, CROSS, CLOCK, STOP, WARN};

/// One line per stage with its attempt count.
pub fn print_stage_summary(report: &RunReport) {
    if report.stages.is_empty() {
        return;
    }
    eprintln!();
    eprintln!("{}", style("Stages").bold());
    for record in &report.stages {
        let icon = if record.succeeded { CHECK } else { CROSS };
        let attempts = if record.attempts == 1 {
            "1 attempt".to_string()
        } else {
            format!("{} attempts", record.attempts)
        };
        match record.kind {
            Some(kind) if !record.succeeded => eprintln!(
                "  {}{:<10} {} [{}]",
                icon,
                record.stage.as_str(),
                style(attempts).dim(),
                kind
            ),
            _ => eprintln!("  {}{:<10} {}", icon, record.stage.as_str(), style(attempts).dim()),
        }
    }
    if let Some(plan) = &report.plan {
        eprintln!("  plan:    {}", plan);
    }
    if let Some(program) = &report.program {
        eprintln!("  program: {}", program);
    }
}

/// Program output goes to stdout; framing and status go to stderr.
///
/// Sandbox faults are tagged with their error kind but are not failures of
/// the run.
pub fn print_execution(outcome: &ExecutionOutcome) {
    let kind = outcome
        .fault_kind()
        .map(|k| format!(" [{}]", k))
        .unwrap_or_default();
    match outcome {
        ExecutionOutcome::Completed {
            stdout,
            stderr,
            exit_code,
        } => {
            eprintln!("{}", style("=== STDOUT ===").cyan());
            print!("{}", stdout);
            if !stdout.is_empty() && !stdout.ends_with('\n') {
                println!();
            }
            if !stderr.is_empty() {
                eprintln!("{}", style("=== STDERR ===").yellow());
                eprint!("{}", stderr);
                if !stderr.ends_with('\n') {
                    eprintln!();
                }
            }
            if *exit_code == 0 {
                eprintln!("{}Program exited with code 0", CHECK);
            } else {
                eprintln!("{}Program exited with code {}", WARN, exit_code);
            }
        }
        ExecutionOutcome::TimedOut => {
            eprintln!("{}{}{}", CLOCK, style("Program timed out").red(), kind);
        }
        ExecutionOutcome::SandboxUnavailable(reason) => {
            eprintln!("{}Sandbox unavailable{}: {}", CROSS, kind, reason);
            eprintln!(
                "   {}",
                style("Is the container runtime installed and its daemon running?").dim()
            );
        }
        ExecutionOutcome::Interrupted => {
            eprintln!("{}Execution interrupted{}", STOP, kind);
        }
    }
}

pub fn print_failure(err: &PipelineError) {
    let icon = match err {
        PipelineError::Interrupted { .. } => STOP,
        _ => CROSS,
    };
    let stage = err.stage().map(|s| s.as_str()).unwrap_or("request");
    eprintln!(
        "{}{} [{}] {}",
        icon,
        style(format!("Failed during {}:", stage)).red().bold(),
        err.kind(),
        err
    );
}
