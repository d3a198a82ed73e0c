//! Docker-backed sandbox.
//!
//! Containers are launched through the container CLI (`docker run --rm ...`)
//! under `process::supervise`; `bollard` talks to the daemon directly for the
//! availability probe and for force-removing a container whose CLI client
//! was killed. Killing the CLI alone does not stop the container.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::query_parameters::RemoveContainerOptionsBuilder;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::SandboxConfig;
use super::process::{ProcessOutcome, supervise};
use super::{ExecutionOutcome, Sandbox, SandboxLimits};
use crate::artifact::ArtifactRef;

/// Working directory (and mount point of the artifact directory) inside the container.
pub const CONTAINER_WORKDIR: &str = "/app";

/// `docker run` exits with 125 when the runtime itself failed (bad image, daemon error).
const RUNTIME_FAILURE_EXIT: i32 = 125;

/// Host variables forwarded to the container CLI; everything else is cleared.
const PASSTHROUGH_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "DOCKER_HOST",
    "DOCKER_CONFIG",
    "DOCKER_CONTEXT",
    "DOCKER_CERT_PATH",
    "DOCKER_TLS_VERIFY",
    "XDG_RUNTIME_DIR",
];

/// Removal attempts after a timeout or cancel. The CLI may be killed while
/// the daemon is still pulling the image or creating the container, so a
/// 404 is retried until the container shows up or the budget runs out.
const TEARDOWN_ATTEMPTS: u32 = 10;
const TEARDOWN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// The only environment the sandboxed program sees.
const CONTAINER_ENV: &[&str] = &["PYTHONDONTWRITEBYTECODE=1", "PYTHONUNBUFFERED=1"];

pub struct DockerSandbox {
    config: SandboxConfig,
    artifacts_dir: PathBuf,
    client: Option<Docker>,
}

impl DockerSandbox {
    /// `artifacts_dir` must be absolute; it is bind-mounted at `/app`.
    pub fn new(config: SandboxConfig, artifacts_dir: impl Into<PathBuf>) -> Self {
        let client = match Docker::connect_with_local_defaults() {
            Ok(client) => Some(client),
            Err(e) => {
                debug!("docker client unavailable: {}", e);
                None
            }
        };
        Self {
            config,
            artifacts_dir: artifacts_dir.into(),
            client,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Fresh container name so a run can be torn down by name.
    pub fn container_name() -> String {
        format!("anvil-sandbox-{}", Uuid::new_v4().simple())
    }

    /// Arguments passed to the container CLI for one run.
    pub fn run_args(&self, program: &ArtifactRef, container: &str, allow_network: bool) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            container.into(),
            "--network".into(),
            if allow_network { "host" } else { "none" }.into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--memory".into(),
            self.config.memory.clone(),
            "--cpus".into(),
            self.config.cpus.to_string(),
            "--pids-limit".into(),
            self.config.pids_limit.to_string(),
        ];
        for var in CONTAINER_ENV {
            args.push("-e".into());
            args.push((*var).into());
        }
        args.push("-v".into());
        args.push(format!(
            "{}:{}",
            self.artifacts_dir.display(),
            CONTAINER_WORKDIR
        ));
        args.push("-w".into());
        args.push(CONTAINER_WORKDIR.into());
        args.push(self.config.image.clone());
        args.extend(self.config.interpreter_argv());
        args.push(program.name.clone());
        args
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.config.runtime);
        cmd.args(args).env_clear();
        for key in PASSTHROUGH_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd
    }

    async fn probe(&self) -> Result<(), String> {
        if !self.config.probe_daemon {
            return Ok(());
        }
        let Some(client) = &self.client else {
            return Err("cannot connect to the Docker daemon".to_string());
        };
        client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| format!("Docker daemon not reachable: {}", e))
    }

    async fn teardown(&self, container: &str) {
        let Some(client) = &self.client else {
            warn!(container, "no docker client; container may outlive the run");
            return;
        };
        let removal = remove_with_retry(TEARDOWN_ATTEMPTS, TEARDOWN_RETRY_DELAY, move || {
            let options = RemoveContainerOptionsBuilder::default().force(true).build();
            client.remove_container(container, Some(options))
        })
        .await;
        match removal {
            Removal::Removed => debug!(container, "container removed"),
            Removal::NeverSeen => debug!(container, "container never appeared"),
            Removal::Failed(e) => warn!(container, "failed to remove container: {}", e),
        }
    }

    fn check_mounted(&self, program: &ArtifactRef) -> Result<(), String> {
        if program.path.parent() != Some(self.artifacts_dir.as_path()) {
            return Err(format!(
                "program {} is outside the mounted artifact directory {}",
                program.path.display(),
                self.artifacts_dir.display()
            ));
        }
        Ok(())
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }
}

#[derive(Debug)]
enum Removal {
    Removed,
    /// Every attempt returned 404: `--rm` already cleaned up, or the
    /// container was never created.
    NeverSeen,
    Failed(bollard::errors::Error),
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

async fn remove_with_retry<F, Fut>(attempts: u32, delay: Duration, mut remove: F) -> Removal
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), bollard::errors::Error>>,
{
    for attempt in 1..=attempts.max(1) {
        match remove().await {
            Ok(()) => return Removal::Removed,
            Err(e) if is_not_found(&e) => {
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return Removal::Failed(e),
        }
    }
    Removal::NeverSeen
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn execute(
        &self,
        program: &ArtifactRef,
        limits: SandboxLimits,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        if let Err(reason) = self.check_mounted(program) {
            return ExecutionOutcome::SandboxUnavailable(reason);
        }
        if let Err(reason) = self.probe().await {
            return ExecutionOutcome::SandboxUnavailable(reason);
        }

        let container = Self::container_name();
        let args = self.run_args(program, &container, limits.allow_network);
        info!(
            container = %container,
            image = %self.config.image,
            program = %program.name,
            network = limits.allow_network,
            timeout_secs = limits.timeout.as_secs(),
            "starting sandbox"
        );
        debug!("{} {}", self.config.runtime, args.join(" "));

        let outcome = match supervise(self.command(&args), limits.timeout, cancel).await {
            Ok(outcome) => outcome,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ExecutionOutcome::SandboxUnavailable(format!(
                    "container runtime '{}' not found on PATH",
                    self.config.runtime
                ));
            }
            Err(e) => {
                return ExecutionOutcome::SandboxUnavailable(format!(
                    "failed to start '{}': {}",
                    self.config.runtime, e
                ));
            }
        };

        match outcome {
            ProcessOutcome::Exited {
                exit_code,
                stdout,
                stderr,
            } => {
                let stderr = String::from_utf8_lossy(&stderr).into_owned();
                if exit_code == RUNTIME_FAILURE_EXIT {
                    return ExecutionOutcome::SandboxUnavailable(format!(
                        "{} run failed: {}",
                        self.config.runtime,
                        stderr.trim()
                    ));
                }
                ExecutionOutcome::Completed {
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr,
                    exit_code,
                }
            }
            ProcessOutcome::TimedOut { .. } => {
                warn!(container = %container, "sandbox timed out, tearing down");
                self.teardown(&container).await;
                ExecutionOutcome::TimedOut
            }
            ProcessOutcome::Cancelled { .. } => {
                warn!(container = %container, "sandbox interrupted, tearing down");
                self.teardown(&container).await;
                ExecutionOutcome::Interrupted
            }
        }
    }
}
