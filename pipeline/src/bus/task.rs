//! Task shapes carried on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tasks recognized on the `incidents` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum IncidentTask {
    /// Run the log→incident reducer for one ingested log.
    ProcessLogEntry { log_id: i64 },
    /// Run the full resolution job for an incident (claim via the ledger
    /// first; losers drop the task).
    ResolveIncident {
        incident_id: i64,
        requested_by_user_id: i64,
    },
    /// Deep RCA + editor prompt + chat notification for an incident that
    /// already has a root cause.
    RcaCursorSlack {
        incident_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<i64>,
    },
}

impl IncidentTask {
    /// The bus key that colocates all work for the same incident on one
    /// partition.
    pub fn partition_key(&self) -> String {
        match self {
            Self::ProcessLogEntry { log_id } => log_id.to_string(),
            Self::ResolveIncident { incident_id, .. } => incident_id.to_string(),
            Self::RcaCursorSlack { incident_id, .. } => incident_id.to_string(),
        }
    }
}

/// Tasks recognized on the `tickets` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum TicketTask {
    /// Attempt automated resolution of an externally-filed ticket.
    ResolveTicket {
        issue_id: String,
        user_id: i64,
    },
}

/// Wire envelope: the task payload plus its creation timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(flatten)]
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
}

/// Payload discriminated per topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskPayload {
    Incident(IncidentTask),
    Ticket(TicketTask),
}

impl TaskEnvelope {
    pub fn incident(task: IncidentTask) -> Self {
        Self {
            payload: TaskPayload::Incident(task),
            created_at: Utc::now(),
        }
    }

    pub fn ticket(task: TicketTask) -> Self {
        Self {
            payload: TaskPayload::Ticket(task),
            created_at: Utc::now(),
        }
    }

    pub fn as_incident(&self) -> Option<&IncidentTask> {
        match &self.payload {
            TaskPayload::Incident(t) => Some(t),
            TaskPayload::Ticket(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_round_trips_with_snake_case_tag() {
        let task = IncidentTask::ResolveIncident {
            incident_id: 5,
            requested_by_user_id: 7,
        };
        let env = TaskEnvelope::incident(task.clone());
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"task_type\":\"resolve_incident\""));
        assert!(json.contains("\"created_at\""));
        let back: TaskEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_incident(), Some(&task));
    }

    #[test]
    fn rca_task_omits_absent_user() {
        let env = TaskEnvelope::incident(IncidentTask::RcaCursorSlack {
            incident_id: 9,
            user_id: None,
        });
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("user_id"));
    }

    #[test]
    fn partition_key_colocates_incident_work() {
        let a = IncidentTask::ResolveIncident {
            incident_id: 12,
            requested_by_user_id: 1,
        };
        let b = IncidentTask::RcaCursorSlack {
            incident_id: 12,
            user_id: Some(1),
        };
        assert_eq!(a.partition_key(), b.partition_key());
    }
}
