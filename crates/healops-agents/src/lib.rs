//! Orchestration layer of the autonomous incident-resolution pipeline:
//! the agent loop, tool-call executor, LLM client, external adapters, and
//! the bus worker that ties them to the deterministic core in `pipeline`.

pub mod adapters;
pub mod agent_loop;
pub mod agents;
pub mod analysis;
pub mod classifier;
pub mod config;
pub mod llm;
pub mod paths;
pub mod toolcall;
pub mod worker;

pub use agent_loop::{AgentLoop, AgentLoopDeps, RunOutcome, RunStatus};
pub use config::EngineConfig;
pub use llm::ChatClient;
pub use worker::IncidentWorker;
