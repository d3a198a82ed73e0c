//! Bounded retry with exponential backoff.
//!
//! Used identically around the Planning and Building stages. The supervisor
//! knows nothing about the errors it absorbs: any `Err` is a failed attempt.
//! Cancellation is not a failure; it ends the loop at once.

use std::future::Future;
use std::time::Duration;

use anvil_common::Stage;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::PipelineError;

/// Delay before the second attempt; doubles for each attempt after that.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }
}

/// Wait after failed attempt number `failed_attempt` (1-based): `base * 2^(n-1)`.
///
/// Equivalently, the wait before attempt `k >= 2` is `base * 2^(k-2)`.
pub fn backoff_delay(base: Duration, failed_attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(failed_attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// A stage payload together with the attempt that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{stage} failed after {attempts} attempts: {cause:#}")]
    Exhausted {
        stage: Stage,
        attempts: u32,
        #[source]
        cause: anyhow::Error,
    },

    #[error("{stage} interrupted during attempt {attempt}")]
    Interrupted { stage: Stage, attempt: u32 },
}

impl RetryError {
    /// Attempts that were started, including an interrupted one.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Interrupted { attempt, .. } => *attempt,
        }
    }
}

impl From<RetryError> for PipelineError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Exhausted {
                stage,
                attempts,
                cause,
            } => PipelineError::StageExhausted {
                stage,
                attempts,
                cause,
            },
            RetryError::Interrupted { stage, .. } => PipelineError::Interrupted { stage },
        }
    }
}

/// Tagged outcome of one retried stage: the payload and its attempt count, or
/// the final failure and how many attempts were made.
pub type StageResult<T> = Result<Attempted<T>, RetryError>;

/// Run `operation` until it succeeds, `policy.max_attempts` is reached, or
/// `cancel` fires.
///
/// `operation` receives the 1-based attempt number.
pub async fn retry_stage<T, F, Fut>(
    stage: Stage,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> StageResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Interrupted { stage, attempt });
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Interrupted { stage, attempt }),
            result = operation(attempt) => result,
        };

        let cause = match result {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                });
            }
            Err(cause) => cause,
        };

        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                stage,
                attempts: attempt,
                cause,
            });
        }

        let delay = backoff_delay(policy.base_delay, attempt);
        let error = format!("{:#}", cause);
        warn!(
            %stage,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "stage attempt failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Interrupted { stage, attempt }),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
