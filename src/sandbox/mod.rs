//! Sandboxed execution of generated programs.
//!
//! The executor mounts only the artifact directory, enforces a hard
//! wall-clock limit and an all-or-nothing network toggle, and captures stdout
//! and stderr separately. It is never retried.

pub mod config;
pub mod docker;
pub mod process;

pub use config::{SandboxConfig, SandboxSection};
pub use docker::DockerSandbox;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::artifact::ArtifactRef;
use crate::errors::ErrorKind;

/// Per-run limits taken from the execution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub allow_network: bool,
}

/// Result of one sandboxed run.
///
/// `Completed` covers every program that ran to exit, whatever its exit code;
/// a non-empty stderr is not a failure on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    TimedOut,
    SandboxUnavailable(String),
    Interrupted,
}

impl ExecutionOutcome {
    /// Whether the program itself exited with status 0.
    pub fn program_succeeded(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed { exit_code: 0, .. })
    }

    /// Error kind of a run that never reached program exit.
    pub fn fault_kind(&self) -> Option<ErrorKind> {
        match self {
            ExecutionOutcome::Completed { .. } => None,
            ExecutionOutcome::TimedOut => Some(ErrorKind::SandboxTimedOut),
            ExecutionOutcome::SandboxUnavailable(_) => Some(ErrorKind::SandboxUnavailable),
            ExecutionOutcome::Interrupted => Some(ErrorKind::Interrupted),
        }
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        program: &ArtifactRef,
        limits: SandboxLimits,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_succeeded_only_on_zero_exit() {
        let ok = ExecutionOutcome::Completed {
            stdout: "2\n".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        let failed = ExecutionOutcome::Completed {
            stdout: String::new(),
            stderr: "Traceback".into(),
            exit_code: 1,
        };
        assert!(ok.program_succeeded());
        assert!(!failed.program_succeeded());
        assert!(!ExecutionOutcome::TimedOut.program_succeeded());
    }

    #[test]
    fn test_fault_kind() {
        let failed = ExecutionOutcome::Completed {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 2,
        };
        assert_eq!(failed.fault_kind(), None);
        assert_eq!(
            ExecutionOutcome::TimedOut.fault_kind(),
            Some(ErrorKind::SandboxTimedOut)
        );
        assert_eq!(
            ExecutionOutcome::SandboxUnavailable("no daemon".into()).fault_kind(),
            Some(ErrorKind::SandboxUnavailable)
        );
    }
}
