//! Task planning: LLM-generated ordered steps with status tracking and
//! bounded replanning.

pub mod parse;
pub mod step;
pub mod task_planner;

use async_trait::async_trait;

pub use step::{PlanStep, StepStatus};
pub use task_planner::{PlanProgress, PlanRevision, TaskPlanner};

/// Minimal completion interface the planner needs from an LLM.
///
/// The orchestration crate provides the HTTP-backed implementation; tests
/// substitute canned responses.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}
