//! Single-stage commands: `anvil plan`, `anvil build`, `anvil exec`.
//!
//! Each runs one stage against the artifact directory, so a pipeline can be
//! resumed or replayed by hand: `plan` writes a plan, `build` turns a stored
//! plan into a program, `exec` runs a stored program.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use anvil::Stage;
use anvil::artifact::{ArtifactKind, ArtifactRef, ArtifactStore, FsArtifactStore};
use anvil::config::AnvilConfig;
use anvil::errors::PipelineError;
use anvil::pipeline::build_attempt;
use anvil::retry::{RetryPolicy, retry_stage};
use anvil::sandbox::{ExecutionOutcome, Sandbox, SandboxLimits};
use anvil::stages::Planner;
use anvil::ui::{self, StageProgress, icons};
use anvil::{ExecutionRequest, Plan};
use console::style;

use super::{
    build_generator, build_planner, build_sandbox, interrupt_token, open_store, print_warnings,
    prompt_or_default,
};

fn policy(config: &AnvilConfig, retries: Option<u32>) -> RetryPolicy {
    RetryPolicy::new(retries.unwrap_or(config.pipeline.retries))
        .with_base_delay(config.coordinator_settings().base_delay)
}

/// Report a stage failure and turn it into an exit code.
fn fail(err: impl Into<PipelineError>) -> i32 {
    let err = err.into();
    ui::print_failure(&err);
    err.exit_code()
}

fn select(
    store: &FsArtifactStore,
    kind: ArtifactKind,
    name: Option<&str>,
) -> Result<ArtifactRef> {
    let artifact = match name {
        Some(name) => store.resolve(kind, name)?,
        None => store.latest(kind)?,
    };
    Ok(artifact)
}

fn load_plan(store: &FsArtifactStore, artifact: &ArtifactRef) -> Result<Plan> {
    let json = store.read(artifact)?;
    let plan: Plan = serde_json::from_str(&json)
        .with_context(|| format!("{} is not a valid plan", artifact))?;
    plan.validate()
        .with_context(|| format!("{} is not a valid plan", artifact))?;
    Ok(plan)
}

pub async fn cmd_plan(config: &AnvilConfig, prompt: &[String], retries: Option<u32>) -> Result<i32> {
    let prompt = prompt_or_default(prompt);
    ExecutionRequest::new(prompt.as_str())
        .with_retries(retries.unwrap_or(config.pipeline.retries))
        .validate()
        .map_err(PipelineError::from)?;

    let store = open_store(config)?;
    let planner = build_planner(config)?;
    let cancel = interrupt_token();

    let progress = StageProgress::new();
    progress.start(format!("{}Planning...", icons::PLAN));
    let planned = retry_stage(
        Stage::Planning,
        policy(config, retries),
        &cancel,
        |_| {
            let planner = &planner;
            let prompt = prompt.as_str();
            async move { planner.plan(prompt).await.map_err(anyhow::Error::from) }
        },
    )
    .await;
    progress.clear();

    let planned = match planned {
        Ok(planned) => planned,
        Err(err) => return Ok(fail(err)),
    };
    let json = serde_json::to_string_pretty(&planned.value).context("Failed to encode plan")?;
    let artifact = match store.put(ArtifactKind::Plan, &json) {
        Ok(artifact) => artifact,
        Err(source) => {
            return Ok(fail(PipelineError::StorageFault {
                stage: Stage::Planning,
                source,
            }));
        }
    };

    let plan = &planned.value;
    println!();
    println!("{}", style(&plan.analysis).bold());
    println!();
    for step in plan.ordered_steps() {
        println!(
            "  {:>3}. {} {}",
            step.id,
            style(&step.action).cyan(),
            step.details
        );
    }
    println!();
    println!("Complexity: {}", plan.estimated_complexity);
    if plan.safety_flag {
        println!("{}Planner flagged this request as potentially unsafe", icons::WARN);
    }
    eprintln!(
        "{}Plan saved to {} ({} attempt(s))",
        icons::FILE_NEW,
        style(&artifact).cyan(),
        planned.attempts
    );
    Ok(0)
}

pub async fn cmd_build(
    config: &AnvilConfig,
    plan_name: Option<&str>,
    retries: Option<u32>,
    allow_network: bool,
) -> Result<i32> {
    let store = open_store(config)?;
    let plan_ref = select(&store, ArtifactKind::Plan, plan_name)?;
    let plan = load_plan(&store, &plan_ref)?;
    let generator = build_generator(config)?;
    let allow_network = allow_network || config.pipeline.allow_network;
    let cancel = interrupt_token();

    eprintln!(
        "{}{} {}",
        icons::BUILD,
        style("Generating program from").bold(),
        plan_ref
    );
    let on_token = |token: &str| {
        print!("{}", token);
        let _ = std::io::stdout().flush();
    };
    let built = retry_stage(
        Stage::Building,
        policy(config, retries),
        &cancel,
        |_| {
            build_attempt(
                &*generator,
                &*store,
                &plan,
                &plan_ref,
                allow_network,
                &on_token,
            )
        },
    )
    .await;
    println!();

    match built {
        Ok(built) => {
            eprintln!(
                "{}Program saved to {} ({} attempt(s))",
                icons::FILE_NEW,
                style(&built.value).cyan(),
                built.attempts
            );
            Ok(0)
        }
        Err(err) => Ok(fail(err)),
    }
}

pub async fn cmd_exec(
    config: &AnvilConfig,
    program_name: Option<&str>,
    timeout_secs: u64,
    allow_network: bool,
) -> Result<i32> {
    let store = open_store(config)?;
    let program = select(&store, ArtifactKind::Program, program_name)?;
    let sandbox = build_sandbox(config, &store);
    print_warnings(&config.sandbox.validate());
    let limits = SandboxLimits {
        timeout: Duration::from_secs(timeout_secs),
        allow_network: allow_network || config.pipeline.allow_network,
    };
    let cancel = interrupt_token();

    eprintln!(
        "{}{} {}",
        icons::RUNNING,
        style("Executing").bold(),
        program
    );
    let outcome = sandbox.execute(&program, limits, &cancel).await;
    Ok(exec_exit_code(&outcome))
}

/// Report an execution and pick the exit code. Only an interrupt fails.
fn exec_exit_code(outcome: &ExecutionOutcome) -> i32 {
    match outcome {
        ExecutionOutcome::Interrupted => fail(PipelineError::Interrupted {
            stage: Stage::Executing,
        }),
        other => {
            ui::print_execution(other);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_select_latest_and_named() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).unwrap();
        assert!(select(&store, ArtifactKind::Plan, None).is_err());

        let first = store.put(ArtifactKind::Plan, "{}").unwrap();
        let named = select(&store, ArtifactKind::Plan, Some(&first.name)).unwrap();
        assert_eq!(named, first);
        assert!(select(&store, ArtifactKind::Plan, Some("plan_0.json")).is_err());
    }

    #[test]
    fn test_load_plan_rejects_invalid_plans() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).unwrap();
        let empty = store
            .put(
                ArtifactKind::Plan,
                r#"{"analysis":"a","steps":[],"estimated_complexity":"low","safety_flag":false}"#,
            )
            .unwrap();
        assert!(load_plan(&store, &empty).is_err());

        let garbage = store.put(ArtifactKind::Plan, "not json").unwrap();
        assert!(load_plan(&store, &garbage).is_err());
    }

    #[test]
    fn test_exec_exit_codes() {
        assert_eq!(exec_exit_code(&ExecutionOutcome::TimedOut), 0);
        assert_eq!(
            exec_exit_code(&ExecutionOutcome::SandboxUnavailable("no daemon".into())),
            0
        );
        let failed = ExecutionOutcome::Completed {
            stdout: String::new(),
            stderr: "boom".into(),
            exit_code: 3,
        };
        assert_eq!(exec_exit_code(&failed), 0);
        assert_eq!(exec_exit_code(&ExecutionOutcome::Interrupted), 130);
    }

    #[test]
    fn test_load_plan_accepts_stored_plan() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).unwrap();
        let artifact = store
            .put(
                ArtifactKind::Plan,
                r#"{"analysis":"a","steps":[{"id":1,"action":"print","details":"hi"}],"estimated_complexity":"low","safety_flag":false}"#,
            )
            .unwrap();
        let plan = load_plan(&store, &artifact).unwrap();
        assert_eq!(plan.steps.len(), 1);
    }
}
