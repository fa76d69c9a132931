//! Event types recorded during an agent run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Types of events in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserRequest,
    AgentAction,
    Observation,
    PlanCreated,
    PlanUpdated,
    PlanStepStarted,
    PlanStepCompleted,
    PlanStepFailed,
    Error,
    MemoryRetrieved,
    KnowledgeRetrieved,
    ValidationResult,
    FileOperation,
    WorkspaceUpdated,
    Compression,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserRequest => "user_request",
            Self::AgentAction => "agent_action",
            Self::Observation => "observation",
            Self::PlanCreated => "plan_created",
            Self::PlanUpdated => "plan_updated",
            Self::PlanStepStarted => "plan_step_started",
            Self::PlanStepCompleted => "plan_step_completed",
            Self::PlanStepFailed => "plan_step_failed",
            Self::Error => "error",
            Self::MemoryRetrieved => "memory_retrieved",
            Self::KnowledgeRetrieved => "knowledge_retrieved",
            Self::ValidationResult => "validation_result",
            Self::FileOperation => "file_operation",
            Self::WorkspaceUpdated => "workspace_updated",
            Self::Compression => "compression",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded event. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub data: Value,
    pub incident_id: i64,
}
