//! Configuration view and validation commands: `anvil config`.

use anyhow::Result;
use anvil::config::{AnvilConfig, CONFIG_DIR, CONFIG_FILE, EndpointConfig};
use anvil::ui::icons;

use super::super::ConfigCommands;

fn print_endpoint(section: &str, endpoint: &EndpointConfig) {
    let key = if endpoint.api_key().is_some() {
        "set"
    } else {
        "missing"
    };
    println!("[{}]", section);
    println!("  base_url = \"{}\"", endpoint.base_url);
    println!("  model = \"{}\"", endpoint.model);
    println!("  api_key_env = \"{}\"  # {}", endpoint.api_key_env, key);
    println!("  temperature = {}", endpoint.temperature);
    println!(
        "  request_timeout_secs = {}",
        endpoint.timeouts.request.as_secs()
    );
    println!("  read_timeout_secs = {}", endpoint.timeouts.read.as_secs());
    println!();
}

pub fn cmd_config(config: &AnvilConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Anvil Configuration");
            println!("===================");
            println!();

            match &config.source {
                Some(path) => println!("Config file: {}", path.display()),
                None => println!(
                    "No config file found at {}/{}, using defaults",
                    CONFIG_DIR, CONFIG_FILE
                ),
            }
            println!();

            println!("artifacts_dir = \"{}\"", config.artifacts_dir.display());
            println!();

            let p = &config.pipeline;
            println!("[pipeline]");
            println!("  timeout_secs = {}", p.timeout_secs);
            println!("  retries = {}", p.retries);
            println!("  allow_network = {}", p.allow_network);
            println!("  poll_attempts = {}", p.poll_attempts);
            println!("  poll_interval_ms = {}", p.poll_interval.as_millis());
            println!();

            print_endpoint("planner", &config.planner);
            print_endpoint("generator", &config.generator);

            let s = &config.sandbox;
            println!("[sandbox]");
            println!("  runtime = \"{}\"", s.runtime);
            println!("  image = \"{}\"", s.image);
            println!("  interpreter = \"{}\"", s.interpreter);
            println!("  memory = \"{}\"", s.memory);
            println!("  cpus = {}", s.cpus);
            println!("  pids_limit = {}", s.pids_limit);
            println!();

            if config.logging.file.is_some() || config.logging.format.is_some() {
                println!("[logging]");
                if let Some(file) = &config.logging.file {
                    println!("  file = \"{}\"", file.display());
                }
                if let Some(format) = &config.logging.format {
                    println!("  format = \"{}\"", format);
                }
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{}Configuration is valid", icons::CHECK);
            } else {
                println!("{}Configuration has {} warning(s):", icons::WARN, warnings.len());
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }
    Ok(())
}
