//! Typed error hierarchy for the anvil pipeline.
//!
//! Four top-level enums cover the subsystems:
//! - `PipelineError`: terminal failures of a coordinator run
//! - `StoreError`: artifact store failures
//! - `PlanningError`: planner adapter failures (retried by the coordinator)
//! - `GenerationError`: generator adapter failures (retried by the coordinator)

use std::path::PathBuf;

use anvil_common::{PlanError, RequestError, Stage};
use thiserror::Error;

/// Errors from the artifact store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Artifact {name} not found")]
    NotFound { name: String },

    #[error("No {kind} artifacts found in {dir}")]
    NoneOfKind { kind: &'static str, dir: PathBuf },

    #[error("Invalid artifact name '{0}'")]
    InvalidName(String),

    #[error("Failed to write artifact at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read artifact at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to scan artifact directory: {0}")]
    Scan(String),

    #[error("Failed to encode artifact: {0}")]
    Encode(String),
}

/// Errors from the planner collaborator.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("Planner request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Planner API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Planner returned an empty response")]
    EmptyResponse,

    #[error("Failed to parse plan: {message}")]
    Parse { message: String, raw: String },

    #[error("Plan rejected: {0}")]
    Invalid(#[from] PlanError),
}

/// Errors from the generator collaborator.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generator request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Generator API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Token stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Generator produced no code")]
    EmptyProgram,
}

/// Terminal failures of a pipeline run.
///
/// Every variant names the stage it belongs to; `StageExhausted` keeps the
/// final underlying cause unchanged so nothing is reinterpreted on the way
/// out.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("{stage} failed after {attempts} attempts: {cause:#}")]
    StageExhausted {
        stage: Stage,
        attempts: u32,
        #[source]
        cause: anyhow::Error,
    },

    #[error("Artifact {artifact} reported by the build stage is not visible after {checks} checks")]
    ArtifactConsistencyFault { artifact: String, checks: u32 },

    #[error("Failed to persist artifact during {stage}: {source}")]
    StorageFault {
        stage: Stage,
        #[source]
        source: StoreError,
    },

    #[error("Sandbox unavailable: {reason}")]
    SandboxUnavailable { reason: String },

    #[error("Sandboxed program exceeded the {timeout_secs}s time limit")]
    SandboxTimedOut { timeout_secs: u64 },

    #[error("Interrupted during {stage}")]
    Interrupted { stage: Stage },
}

/// Stable classification of a `PipelineError`, used in reports and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    StageExhausted,
    ArtifactConsistencyFault,
    StorageFault,
    SandboxUnavailable,
    SandboxTimedOut,
    Interrupted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::StageExhausted => "StageExhausted",
            ErrorKind::ArtifactConsistencyFault => "ArtifactConsistencyFault",
            ErrorKind::StorageFault => "StorageFault",
            ErrorKind::SandboxUnavailable => "SandboxUnavailable",
            ErrorKind::SandboxTimedOut => "SandboxTimedOut",
            ErrorKind::Interrupted => "Interrupted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            PipelineError::StageExhausted { .. } => ErrorKind::StageExhausted,
            PipelineError::ArtifactConsistencyFault { .. } => ErrorKind::ArtifactConsistencyFault,
            PipelineError::StorageFault { .. } => ErrorKind::StorageFault,
            PipelineError::SandboxUnavailable { .. } => ErrorKind::SandboxUnavailable,
            PipelineError::SandboxTimedOut { .. } => ErrorKind::SandboxTimedOut,
            PipelineError::Interrupted { .. } => ErrorKind::Interrupted,
        }
    }

    /// The stage the failure belongs to. Request validation happens before any stage.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::InvalidRequest(_) => None,
            PipelineError::StageExhausted { stage, .. }
            | PipelineError::StorageFault { stage, .. }
            | PipelineError::Interrupted { stage } => Some(*stage),
            PipelineError::ArtifactConsistencyFault { .. } => Some(Stage::Building),
            PipelineError::SandboxUnavailable { .. } | PipelineError::SandboxTimedOut { .. } => {
                Some(Stage::Executing)
            }
        }
    }

    /// Process exit code for the CLI: 130 for interrupts (as a shell reports SIGINT), 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Interrupted { .. } => 130,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_exhausted_keeps_raw_cause() {
        let err = PipelineError::StageExhausted {
            stage: Stage::Planning,
            attempts: 3,
            cause: anyhow::anyhow!("Failed to parse plan: missing field `steps`"),
        };
        let msg = err.to_string();
        assert!(msg.contains("Planning failed after 3 attempts"));
        assert!(msg.contains("missing field `steps`"));
        assert_eq!(err.kind(), ErrorKind::StageExhausted);
        assert_eq!(err.stage(), Some(Stage::Planning));
    }

    #[test]
    fn stage_exhausted_source_is_the_cause() {
        use std::error::Error as _;
        let err = PipelineError::StageExhausted {
            stage: Stage::Building,
            attempts: 1,
            cause: anyhow::anyhow!("boom"),
        };
        assert_eq!(err.source().map(|s| s.to_string()), Some("boom".to_string()));
    }

    #[test]
    fn consistency_fault_belongs_to_building() {
        let err = PipelineError::ArtifactConsistencyFault {
            artifact: "output_1.py".into(),
            checks: 10,
        };
        assert_eq!(err.stage(), Some(Stage::Building));
        assert_eq!(err.kind(), ErrorKind::ArtifactConsistencyFault);
        assert!(err.to_string().contains("output_1.py"));
    }

    #[test]
    fn sandbox_errors_belong_to_executing() {
        let timeout = PipelineError::SandboxTimedOut { timeout_secs: 10 };
        let unavailable = PipelineError::SandboxUnavailable {
            reason: "daemon down".into(),
        };
        assert_eq!(timeout.stage(), Some(Stage::Executing));
        assert_eq!(unavailable.stage(), Some(Stage::Executing));
        assert!(timeout.to_string().contains("10s"));
    }

    #[test]
    fn interrupted_exits_130() {
        let err = PipelineError::Interrupted {
            stage: Stage::Building,
        };
        assert_eq!(err.exit_code(), 130);
        assert_eq!(
            PipelineError::SandboxTimedOut { timeout_secs: 1 }.exit_code(),
            1
        );
    }

    #[test]
    fn invalid_request_has_no_stage() {
        let err: PipelineError = RequestError::ZeroTimeout.into();
        assert_eq!(err.stage(), None);
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn planning_error_converts_from_plan_error() {
        let err: PlanningError = PlanError::NoSteps.into();
        assert!(matches!(err, PlanningError::Invalid(PlanError::NoSteps)));
        assert!(err.to_string().contains("no steps"));
    }

    #[test]
    fn store_error_not_found_carries_name() {
        let err = StoreError::NotFound {
            name: "plan_42.json".into(),
        };
        assert!(err.to_string().contains("plan_42.json"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::InvalidName("x".into()));
        assert_std_error(&PlanningError::EmptyResponse);
        assert_std_error(&GenerationError::EmptyProgram);
        assert_std_error(&PipelineError::Interrupted {
            stage: Stage::Planning,
        });
    }
}
