use std::sync::Arc;
use std::time::Duration;

use anvil_common::{ExecutionRequest, Plan, Stage};
use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CoordinatorSettings, PipelineOutcome, PipelineState, RunReport, StageRecord};
use crate::artifact::{ArtifactKind, ArtifactRef, ArtifactStore};
use crate::errors::{PipelineError, StoreError};
use crate::retry::{Attempted, RetryPolicy, StageResult, retry_stage};
use crate::sandbox::{ExecutionOutcome, Sandbox, SandboxLimits};
use crate::stages::{Generator, Planner, collect_program};

/// Receives generated tokens as they stream in.
pub type TokenSink = Arc<dyn Fn(&str) + Send + Sync>;
/// Notified on every state transition, before the state's work starts.
pub type StateSink = Arc<dyn Fn(PipelineState) + Send + Sync>;

pub struct Coordinator {
    planner: Arc<dyn Planner>,
    generator: Arc<dyn Generator>,
    store: Arc<dyn ArtifactStore>,
    sandbox: Arc<dyn Sandbox>,
    settings: CoordinatorSettings,
    on_token: TokenSink,
    on_state: StateSink,
}

/// One Building attempt: generate, consume the stream, persist the program
/// next to its plan. Shared by the coordinator and `anvil build`.
pub async fn build_attempt(
    generator: &dyn Generator,
    store: &dyn ArtifactStore,
    plan: &Plan,
    plan_ref: &ArtifactRef,
    allow_network: bool,
    on_token: &(dyn Fn(&str) + Send + Sync),
) -> anyhow::Result<ArtifactRef> {
    let tokens = generator.generate(plan, allow_network).await?;
    let program = collect_program(tokens, on_token).await?;
    store
        .put_program(&program, Some(plan_ref))
        .context("failed to persist generated program")
}

/// Mutable bookkeeping for one run; becomes the `RunReport`.
struct Trace {
    on_state: StateSink,
    states: Vec<PipelineState>,
    stages: Vec<StageRecord>,
    plan: Option<ArtifactRef>,
    program: Option<ArtifactRef>,
}

impl Trace {
    fn new(on_state: StateSink) -> Self {
        Self {
            on_state,
            states: Vec::new(),
            stages: Vec::new(),
            plan: None,
            program: None,
        }
    }

    fn enter(&mut self, state: PipelineState) {
        info!(state = %state, "pipeline state");
        self.states.push(state);
        (self.on_state)(state);
    }

    fn record<T>(&mut self, stage: Stage, result: StageResult<T>) -> Result<T, PipelineError> {
        match result {
            Ok(Attempted { value, attempts }) => {
                info!(%stage, attempts, "stage succeeded");
                self.stages.push(StageRecord {
                    stage,
                    attempts,
                    succeeded: true,
                    kind: None,
                    error: None,
                });
                Ok(value)
            }
            Err(err) => {
                let attempts = err.attempts();
                let err = PipelineError::from(err);
                self.stages.push(StageRecord {
                    stage,
                    attempts,
                    succeeded: false,
                    kind: Some(err.kind()),
                    error: Some(err.to_string()),
                });
                Err(err)
            }
        }
    }

    fn finish(mut self, outcome: PipelineOutcome) -> RunReport {
        self.enter(PipelineState::Terminal);
        RunReport {
            states: self.states,
            stages: self.stages,
            plan: self.plan,
            program: self.program,
            outcome,
        }
    }
}

impl Coordinator {
    pub fn new(
        planner: Arc<dyn Planner>,
        generator: Arc<dyn Generator>,
        store: Arc<dyn ArtifactStore>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Self {
        Self {
            planner,
            generator,
            store,
            sandbox,
            settings: CoordinatorSettings::default(),
            on_token: Arc::new(|_: &str| {}),
            on_state: Arc::new(|_: PipelineState| {}),
        }
    }

    pub fn with_settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_token_sink(mut self, sink: TokenSink) -> Self {
        self.on_token = sink;
        self
    }

    pub fn with_state_sink(mut self, sink: StateSink) -> Self {
        self.on_state = sink;
        self
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Drive one request to a terminal outcome. Never panics on stage
    /// failure; every failure ends up in `RunReport::outcome`.
    pub async fn run(&self, request: &ExecutionRequest, cancel: &CancellationToken) -> RunReport {
        let mut trace = Trace::new(self.on_state.clone());
        let outcome = match self.drive(request, cancel, &mut trace).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    stage = err.stage().map(|s| s.as_str()).unwrap_or("-"),
                    kind = %err.kind(),
                    "pipeline failed: {}",
                    err
                );
                PipelineOutcome::Failed(err)
            }
        };
        trace.finish(outcome)
    }

    async fn drive(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
        trace: &mut Trace,
    ) -> Result<PipelineOutcome, PipelineError> {
        request.validate()?;
        let policy =
            RetryPolicy::new(request.max_retries_per_stage).with_base_delay(self.settings.base_delay);

        trace.enter(PipelineState::Planning);
        let planner = &self.planner;
        let request_text = request.request_text.as_str();
        let planned = retry_stage(Stage::Planning, policy, cancel, |attempt| async move {
            debug!(attempt, "requesting plan");
            planner.plan(request_text).await.map_err(anyhow::Error::from)
        })
        .await;
        let plan = trace.record(Stage::Planning, planned)?;

        // Persisted before the next stage; a failure here is not retried.
        let plan_ref = serde_json::to_string_pretty(&plan)
            .map_err(|e| StoreError::Encode(e.to_string()))
            .and_then(|json| self.store.put(ArtifactKind::Plan, &json))
            .map_err(|source| PipelineError::StorageFault {
                stage: Stage::Planning,
                source,
            })?;
        info!(plan = %plan_ref.name, steps = plan.steps.len(), "plan persisted");
        trace.plan = Some(plan_ref.clone());

        trace.enter(PipelineState::Building);
        let generator = self.generator.as_ref();
        let store = self.store.as_ref();
        let on_token = self.on_token.as_ref();
        let plan = &plan;
        let plan_ref = &plan_ref;
        let allow_network = request.allow_network;
        let built = retry_stage(Stage::Building, policy, cancel, |attempt| async move {
            debug!(attempt, "generating program");
            build_attempt(generator, store, plan, plan_ref, allow_network, on_token).await
        })
        .await;
        let program_ref = trace.record(Stage::Building, built)?;
        info!(program = %program_ref.name, "program persisted");
        trace.program = Some(program_ref.clone());

        trace.enter(PipelineState::AwaitingArtifact);
        self.await_artifact(&program_ref, cancel).await?;

        if request.dry_run {
            trace.enter(PipelineState::DryRunSkip);
            info!(program = %program_ref.name, "dry run: skipping execution");
            return Ok(PipelineOutcome::DryRunCompleted {
                artifact: program_ref,
            });
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Interrupted {
                stage: Stage::Executing,
            });
        }

        trace.enter(PipelineState::Executing);
        let limits = SandboxLimits {
            timeout: Duration::from_secs(request.timeout_seconds),
            allow_network: request.allow_network,
        };
        let execution = self.sandbox.execute(&program_ref, limits, cancel).await;
        let fault = match &execution {
            ExecutionOutcome::Completed { exit_code, .. } => {
                info!(exit_code, "program finished");
                None
            }
            ExecutionOutcome::TimedOut => Some(PipelineError::SandboxTimedOut {
                timeout_secs: request.timeout_seconds,
            }),
            ExecutionOutcome::SandboxUnavailable(reason) => Some(PipelineError::SandboxUnavailable {
                reason: reason.clone(),
            }),
            ExecutionOutcome::Interrupted => Some(PipelineError::Interrupted {
                stage: Stage::Executing,
            }),
        };
        trace.stages.push(StageRecord {
            stage: Stage::Executing,
            attempts: 1,
            succeeded: fault.is_none(),
            kind: fault.as_ref().map(PipelineError::kind),
            error: fault.as_ref().map(ToString::to_string),
        });

        // Only an interrupt aborts the run; sandbox faults are reported with it.
        match fault {
            Some(err @ PipelineError::Interrupted { .. }) => return Err(err),
            Some(err) => warn!(kind = %err.kind(), "program did not run to exit: {}", err),
            None => {}
        }
        Ok(PipelineOutcome::Completed {
            artifact: program_ref,
            execution,
        })
    }

    /// Bounded existence poll for the build artifact.
    async fn await_artifact(
        &self,
        artifact: &ArtifactRef,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let checks = self.settings.poll_attempts.max(1);
        for check in 1..=checks {
            if self.store.exists(artifact) {
                debug!(check, artifact = %artifact.name, "artifact visible");
                return Ok(());
            }
            if check < checks {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(PipelineError::Interrupted { stage: Stage::Building });
                    }
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }
        Err(PipelineError::ArtifactConsistencyFault {
            artifact: artifact.name.clone(),
            checks,
        })
    }
}
