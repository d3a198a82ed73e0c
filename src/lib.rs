//! anvil: turn a natural-language request into a program and run it in a
//! container, in three supervised stages (plan, build, execute).
//!
//! The binary wires HTTP model endpoints, the artifact directory and a
//! Docker sandbox into [`pipeline::Coordinator`]; everything behind those
//! seams is a trait so tests can swap in fakes.

pub mod artifact;
pub mod config;
pub mod errors;
pub mod logging;
pub mod pipeline;
pub mod retry;
pub mod sandbox;
pub mod stages;
pub mod ui;

pub use anvil_common::{ExecutionRequest, Plan, Stage, Step};
