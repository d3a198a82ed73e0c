//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled                 |
//! |-------------|----------------------------------|
//! | `run`       | `Run`                            |
//! | `stage`     | `Plan`, `Build`, `Exec`          |
//! | `artifacts` | `Artifacts`                      |
//! | `config`    | `Config`                         |
//!
//! Handlers return the process exit code; `Err` is reserved for setup
//! problems (bad config, missing credentials) and exits with 1.

pub mod artifacts;
pub mod config;
pub mod run;
pub mod stage;

pub use artifacts::cmd_artifacts;
pub use config::cmd_config;
pub use run::cmd_run;
pub use stage::{cmd_build, cmd_exec, cmd_plan};

use std::sync::Arc;

use anyhow::{Context, Result};
use anvil::artifact::FsArtifactStore;
use anvil::config::{AnvilConfig, EndpointConfig};
use anvil::sandbox::DockerSandbox;
use anvil::stages::{ChatClient, HttpGenerator, HttpPlanner};
use anvil::ui::icons;
use console::style;
use tokio_util::sync::CancellationToken;

/// Used by `run` when no prompt is given.
pub const DEFAULT_PROMPT: &str = "Write a Python script that calculates the first 20 Fibonacci \
numbers and prints them.";

/// Join prompt words, falling back to the default prompt with a warning.
pub fn prompt_or_default(words: &[String]) -> String {
    let prompt = words.join(" ");
    if prompt.trim().is_empty() {
        eprintln!(
            "{} No prompt given; using the default: {}",
            icons::WARN,
            style(DEFAULT_PROMPT).dim()
        );
        DEFAULT_PROMPT.to_string()
    } else {
        prompt
    }
}

/// A token cancelled on the first Ctrl-C.
pub fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!(
                "{} {}",
                icons::STOP,
                style("Interrupt received, shutting down...").red()
            );
            trigger.cancel();
        }
    });
    token
}

pub fn open_store(config: &AnvilConfig) -> Result<Arc<FsArtifactStore>> {
    let store = FsArtifactStore::open(&config.artifacts_dir).with_context(|| {
        format!(
            "Failed to open artifact directory {}",
            config.artifacts_dir.display()
        )
    })?;
    Ok(Arc::new(store))
}

fn chat_client(endpoint: &EndpointConfig, role: &str) -> Result<ChatClient> {
    let key = endpoint.api_key().with_context(|| {
        format!(
            "{} is not set. Export it or add it to the anvil env file ({} endpoint {})",
            endpoint.api_key_env, role, endpoint.base_url
        )
    })?;
    ChatClient::with_timeouts(&endpoint.base_url, key, endpoint.timeouts)
        .with_context(|| format!("Failed to build HTTP client for the {} endpoint", role))
}

pub fn build_planner(config: &AnvilConfig) -> Result<Arc<HttpPlanner>> {
    let client = chat_client(&config.planner, "planner")?;
    Ok(Arc::new(
        HttpPlanner::new(client, &config.planner.model).with_temperature(config.planner.temperature),
    ))
}

pub fn build_generator(config: &AnvilConfig) -> Result<Arc<HttpGenerator>> {
    let client = chat_client(&config.generator, "generator")?;
    Ok(Arc::new(
        HttpGenerator::new(client, &config.generator.model)
            .with_temperature(config.generator.temperature),
    ))
}

pub fn build_sandbox(config: &AnvilConfig, store: &FsArtifactStore) -> Arc<DockerSandbox> {
    use anvil::artifact::ArtifactStore;
    Arc::new(DockerSandbox::new(config.sandbox.clone(), store.root()))
}

/// Print the config warnings that matter for the command about to run.
pub fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("{} {}", icons::WARN, style(warning).yellow());
    }
}
