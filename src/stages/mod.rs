//! Stage collaborators: the planner and the generator.
//!
//! The coordinator only sees the `Planner` and `Generator` traits. The HTTP
//! adapters here speak the OpenAI chat-completions dialect; tests substitute
//! in-process fakes.

pub mod generator;
pub mod openai;
pub mod planner;
pub mod prompts;

pub use generator::{HttpGenerator, collect_program, strip_code_fences};
pub use openai::{ChatClient, ChatTimeouts};
pub use planner::{HttpPlanner, decode_plan};

use anvil_common::Plan;
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::{GenerationError, PlanningError};

/// Program text as it streams out of the generator, token by token.
pub type TokenStream = BoxStream<'static, Result<String, GenerationError>>;

/// Converts a request into a structured plan.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request_text: &str) -> Result<Plan, PlanningError>;
}

/// Converts a plan into program source text.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Start generation. The stream must be consumed to completion; an error
    /// item ends it.
    async fn generate(&self, plan: &Plan, allow_network: bool)
    -> Result<TokenStream, GenerationError>;
}
