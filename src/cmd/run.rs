//! Full pipeline command: `anvil run`.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use anvil::ExecutionRequest;
use anvil::config::AnvilConfig;
use anvil::pipeline::{Coordinator, PipelineOutcome, PipelineState};
use anvil::ui::{self, StageProgress, icons};
use console::style;

use super::{
    build_generator, build_planner, build_sandbox, interrupt_token, open_store, print_warnings,
    prompt_or_default,
};

#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub prompt: Vec<String>,
    pub dry_run: bool,
    pub timeout: Option<u64>,
    pub retries: Option<u32>,
    pub allow_network: bool,
}

impl RunArgs {
    /// CLI flags layered over the configured defaults.
    pub fn request(&self, config: &AnvilConfig, prompt: String) -> ExecutionRequest {
        ExecutionRequest::new(prompt)
            .with_dry_run(self.dry_run)
            .with_timeout(self.timeout.unwrap_or(config.pipeline.timeout_secs))
            .with_retries(self.retries.unwrap_or(config.pipeline.retries))
            .with_network(self.allow_network || config.pipeline.allow_network)
    }
}

pub async fn cmd_run(config: &AnvilConfig, args: RunArgs) -> Result<i32> {
    let prompt = prompt_or_default(&args.prompt);
    let request = args.request(config, prompt);

    let store = open_store(config)?;
    let planner = build_planner(config)?;
    let generator = build_generator(config)?;
    let sandbox = build_sandbox(config, &store);
    print_warnings(&config.sandbox.validate());

    eprintln!(
        "{}{} {}",
        icons::SPARKLE,
        style("anvil").bold(),
        style(&request.request_text).dim()
    );
    if request.allow_network {
        eprintln!("{}Network access enabled for the sandbox", icons::WARN);
    }

    let progress = StageProgress::new();
    let state_progress = progress.clone();
    let coordinator = Coordinator::new(planner, generator, store, sandbox)
        .with_settings(config.coordinator_settings())
        .with_state_sink(Arc::new(move |state: PipelineState| state_progress.on_state(state)))
        .with_token_sink(Arc::new(|token: &str| {
            print!("{}", token);
            let _ = std::io::stdout().flush();
        }));

    let cancel = interrupt_token();
    let report = coordinator.run(&request, &cancel).await;
    progress.clear();
    println!();

    ui::print_stage_summary(&report);
    eprintln!();
    match &report.outcome {
        PipelineOutcome::Completed { execution, .. } => ui::print_execution(execution),
        PipelineOutcome::DryRunCompleted { artifact } => {
            eprintln!(
                "{}Dry run complete. Program saved to {}",
                icons::CHECK,
                style(artifact).cyan()
            );
        }
        PipelineOutcome::Failed(err) => ui::print_failure(err),
    }

    Ok(report.exit_code())
}
