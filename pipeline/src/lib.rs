//! Deterministic core of the autonomous incident-resolution pipeline.
//!
//! This crate holds everything that does not talk to an LLM or an external
//! API directly: the incident model and its reducer, the resolution-request
//! ledger, the message-bus gateway, the agent event stream, the task
//! planner, the workspace/scratchpad pair, the memory and knowledge layers,
//! telemetry, and storage backends. The orchestration binary
//! (`healops-agents`) wires these together with the LLM client, tool
//! executor, and external adapters.

pub mod bus;
pub mod config;
pub mod errors;
pub mod events;
pub mod fingerprint;
pub mod incident;
pub mod knowledge;
pub mod ledger;
pub mod memory;
pub mod planner;
pub mod reducer;
pub mod scratchpad;
pub mod storage;
pub mod telemetry;
pub mod workspace;

pub use bus::{IncidentTask, InProcessBus, MessageBus, TaskEnvelope, TaskHandler, Topic};
pub use config::PipelineConfig;
pub use errors::{PipelineError, PipelineResult};
pub use events::{AgentEvent, EventStream, EventType};
pub use incident::{
    Incident, IncidentSeverity, IncidentStatus, IntegrationRecord, LogEntry, LogSeverity,
};
pub use ledger::{InMemoryLedger, ResolutionLedger, ResolutionRequests, ResolutionState};
pub use memory::{FailsafeMemory, InMemoryMemoryStore, MemoryContext, MemoryStore};
pub use planner::{CompletionClient, PlanStep, StepStatus, TaskPlanner};
pub use reducer::{LogReducer, ReducerOutcome, TicketCreator, TitleGenerator};
pub use workspace::{Workspace, WorkspaceRecord};
