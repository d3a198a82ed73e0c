use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use anvil::config::{AnvilConfig, load_secrets_file};
use anvil::logging::{self, LogFormat, LogOptions};
use clap::{ArgAction, Parser, Subcommand};
use console::style;
use tracing::debug;

mod cmd;

#[derive(Parser)]
#[command(name = "anvil")]
#[command(
    version,
    about = "Turn a natural-language request into a program and run it in a sandbox"
)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG wins when set.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format on stderr
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Config file to read instead of .anvil/anvil.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding plans and programs. Overrides anvil.toml and ANVIL_ARTIFACTS_DIR.
    #[arg(long, global = true)]
    pub artifacts_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Plan, build and execute a request end to end
    Run {
        /// What the program should do. A default demo prompt is used when empty.
        prompt: Vec<String>,

        /// Stop after the program is written; never execute it
        #[arg(long)]
        dry_run: bool,

        /// Execution time limit in seconds
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,

        /// Attempts per retried stage
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        retries: Option<u32>,

        /// Give the sandboxed program network access
        #[arg(long)]
        allow_network: bool,
    },
    /// Turn a request into a stored plan
    Plan {
        prompt: Vec<String>,

        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        retries: Option<u32>,
    },
    /// Generate a program from a stored plan (the newest by default)
    Build {
        /// Plan file name inside the artifacts directory
        #[arg(long)]
        plan: Option<String>,

        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        retries: Option<u32>,

        #[arg(long)]
        allow_network: bool,
    },
    /// Run a stored program in the sandbox (the newest by default)
    Exec {
        /// Program file name inside the artifacts directory
        program: Option<String>,

        #[arg(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
        timeout: u64,

        #[arg(long)]
        allow_network: bool,
    },
    /// List stored plans and programs, newest first
    Artifacts {
        /// plans or programs; both when omitted
        kind: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the resolved configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

fn load_config(cli: &Cli) -> Result<AnvilConfig> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let mut config = AnvilConfig::load(&project_dir, cli.config.as_deref())?;
    if let Some(dir) = &cli.artifacts_dir {
        config.artifacts_dir = dir.clone();
    }
    Ok(config)
}

async fn dispatch(cli: Cli, config: AnvilConfig) -> Result<i32> {
    match cli.command {
        Commands::Run {
            prompt,
            dry_run,
            timeout,
            retries,
            allow_network,
        } => {
            let args = cmd::run::RunArgs {
                prompt,
                dry_run,
                timeout,
                retries,
                allow_network,
            };
            cmd::cmd_run(&config, args).await
        }
        Commands::Plan { prompt, retries } => cmd::cmd_plan(&config, &prompt, retries).await,
        Commands::Build {
            plan,
            retries,
            allow_network,
        } => cmd::cmd_build(&config, plan.as_deref(), retries, allow_network).await,
        Commands::Exec {
            program,
            timeout,
            allow_network,
        } => cmd::cmd_exec(&config, program.as_deref(), timeout, allow_network).await,
        Commands::Artifacts { kind, limit } => {
            cmd::cmd_artifacts(&config, kind.as_deref(), limit).map(|_| 0)
        }
        Commands::Config { command } => cmd::cmd_config(&config, command).map(|_| 0),
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = load_config(&cli)?;
    let format = match (cli.log_format, &config.logging.format) {
        (Some(format), _) => format,
        (None, Some(name)) => name.parse()?,
        (None, None) => LogFormat::default(),
    };
    let _guard = logging::init(&LogOptions {
        verbosity: cli.verbose,
        format,
        file: config.logging.file.clone(),
    })?;
    debug!(
        project_dir = %config.project_dir.display(),
        artifacts_dir = %config.artifacts_dir.display(),
        "configuration loaded"
    );
    dispatch(cli, config).await
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Loaded before the runtime starts so no other thread reads the environment meanwhile.
    let secrets = load_secrets_file();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{} failed to start async runtime: {}", style("error:").red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    let result = secrets.and_then(|_| runtime.block_on(run(cli)));
    match result {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
