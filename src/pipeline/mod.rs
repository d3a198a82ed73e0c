//! Pipeline coordinator: Plan → Build → Execute.
//!
//! ```text
//! Planning → Building → AwaitingArtifact ─┬─ Executing ──┬─ Terminal
//!                                         └─ DryRunSkip ─┘
//! ```
//!
//! Planning and Building run under the retry supervisor; the artifact wait
//! and execution are never retried.

mod coordinator;

pub use coordinator::{Coordinator, StateSink, TokenSink, build_attempt};

use std::fmt;
use std::time::Duration;

use anvil_common::Stage;

use crate::artifact::ArtifactRef;
use crate::errors::{ErrorKind, PipelineError};
use crate::retry::DEFAULT_BASE_DELAY;
use crate::sandbox::ExecutionOutcome;

/// Existence checks made for the build artifact before giving up.
pub const DEFAULT_POLL_ATTEMPTS: u32 = 10;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub base_delay: Duration,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Planning,
    Building,
    AwaitingArtifact,
    Executing,
    DryRunSkip,
    Terminal,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Planning => "Planning",
            PipelineState::Building => "Building",
            PipelineState::AwaitingArtifact => "AwaitingArtifact",
            PipelineState::Executing => "Executing",
            PipelineState::DryRunSkip => "DryRunSkip",
            PipelineState::Terminal => "Terminal",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one run.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// The Executor was invoked. The program may have exited non-zero, timed
    /// out, or found no sandbox; none of these abort the run.
    Completed {
        artifact: ArtifactRef,
        execution: ExecutionOutcome,
    },
    DryRunCompleted {
        artifact: ArtifactRef,
    },
    Failed(PipelineError),
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, PipelineOutcome::Failed(_))
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            PipelineOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn artifact(&self) -> Option<&ArtifactRef> {
        match self {
            PipelineOutcome::Completed { artifact, .. }
            | PipelineOutcome::DryRunCompleted { artifact } => Some(artifact),
            PipelineOutcome::Failed(_) => None,
        }
    }

    /// Sandbox fault of a completed run, if the program never reached exit.
    pub fn execution_fault(&self) -> Option<ErrorKind> {
        match self {
            PipelineOutcome::Completed { execution, .. } => execution.fault_kind(),
            _ => None,
        }
    }

    /// Process exit code for the CLI: 0 on success, 130 if interrupted, else 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineOutcome::Failed(err) => err.exit_code(),
            _ => 0,
        }
    }
}

/// Attempt accounting for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: Stage,
    pub attempts: u32,
    pub succeeded: bool,
    pub kind: Option<ErrorKind>,
    pub error: Option<String>,
}

/// Everything a caller learns about a run.
#[derive(Debug)]
pub struct RunReport {
    /// States in the order they were entered, ending with `Terminal`.
    pub states: Vec<PipelineState>,
    pub stages: Vec<StageRecord>,
    pub plan: Option<ArtifactRef>,
    pub program: Option<ArtifactRef>,
    pub outcome: PipelineOutcome,
}

impl RunReport {
    pub fn attempts(&self, stage: Stage) -> Option<u32> {
        self.stages
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| r.attempts)
    }

    pub fn visited(&self, state: PipelineState) -> bool {
        self.states.contains(&state)
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}
