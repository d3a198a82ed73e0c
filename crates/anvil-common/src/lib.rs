//! Shared domain types for the anvil pipeline.
//!
//! These types cross every seam of the pipeline: the planner produces a
//! [`Plan`], the coordinator persists it, the generator consumes it, and the
//! whole run is parameterised by an [`ExecutionRequest`].

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default wall-clock limit for sandbox execution, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
/// Default attempt budget for each retried stage.
pub const DEFAULT_RETRIES_PER_STAGE: u32 = 3;

/// A single step of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within its plan; need not be sorted or contiguous.
    pub id: i64,
    /// Action verb, e.g. "define" or "print".
    pub action: String,
    /// Precise instructions for the step.
    pub details: String,
}

/// Structured plan describing the program to generate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub analysis: String,
    pub steps: Vec<Step>,
    pub estimated_complexity: String,
    pub safety_flag: bool,
}

/// Violations of the plan invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("plan has no steps")]
    NoSteps,

    #[error("step id {id} appears more than once")]
    DuplicateStepId { id: i64 },
}

impl Plan {
    /// Check the invariants every successfully planned `Plan` must hold.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::NoSteps);
        }
        let mut seen = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if !seen.insert(step.id) {
                return Err(PlanError::DuplicateStepId { id: step.id });
            }
        }
        Ok(())
    }

    /// Steps in the order the planner emitted them.
    pub fn ordered_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }
}

/// A discrete unit of the pipeline with its own success/failure semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Planning,
    Building,
    Executing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Planning => "Planning",
            Stage::Building => "Building",
            Stage::Executing => "Executing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of one pipeline run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub request_text: String,
    pub dry_run: bool,
    pub timeout_seconds: u64,
    pub max_retries_per_stage: u32,
    pub allow_network: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request text is empty")]
    EmptyRequest,

    #[error("timeout_seconds must be greater than zero")]
    ZeroTimeout,

    #[error("max_retries_per_stage must be at least 1")]
    ZeroRetries,
}

impl ExecutionRequest {
    /// A request with the CLI defaults: 120 s timeout, 3 attempts, no network.
    pub fn new(request_text: impl Into<String>) -> Self {
        Self {
            request_text: request_text.into(),
            dry_run: false,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            max_retries_per_stage: DEFAULT_RETRIES_PER_STAGE,
            allow_network: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_retries(mut self, attempts: u32) -> Self {
        self.max_retries_per_stage = attempts;
        self
    }

    pub fn with_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.request_text.trim().is_empty() {
            return Err(RequestError::EmptyRequest);
        }
        if self.timeout_seconds == 0 {
            return Err(RequestError::ZeroTimeout);
        }
        if self.max_retries_per_stage == 0 {
            return Err(RequestError::ZeroRetries);
        }
        Ok(())
    }
}
