//! Incident domain model: log entries, incidents, integrations, and the
//! status state machine.
//!
//! Incidents are the central aggregate: a durable grouping of critical log
//! entries judged to represent one logical problem within a short time
//! window for one service. The reducer mutates them under bus-partition
//! serialization; the resolver mutates them under a ledger claim.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of an ingested log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogSeverity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Unknown,
}

impl LogSeverity {
    /// Whether this severity participates in incident creation.
    pub fn is_incident_worthy(self) -> bool {
        matches!(self, Self::Error | Self::Critical)
    }
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Incident severity. Ordered so that escalation comparisons read naturally:
/// `Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for IncidentSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

/// Incident lifecycle status.
///
/// Transitions form a DAG:
/// ```text
/// OPEN → INVESTIGATING → HEALING → {RESOLVED, FAILED}
/// OPEN → FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentStatus {
    Open,
    Investigating,
    Healing,
    Resolved,
    Failed,
}

impl IncidentStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed)
    }

    /// Whether `self → to` is a legal edge in the status DAG.
    pub fn can_transition_to(self, to: IncidentStatus) -> bool {
        use IncidentStatus::*;
        matches!(
            (self, to),
            (Open, Investigating)
                | (Open, Failed)
                | (Investigating, Healing)
                | (Healing, Resolved)
                | (Healing, Failed)
        )
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "OPEN",
            Self::Investigating => "INVESTIGATING",
            Self::Healing => "HEALING",
            Self::Resolved => "RESOLVED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of the log that created an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub log_id: i64,
    pub message: String,
    pub level: LogSeverity,
}

/// Pull-request info attached to a resolved incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrInfo {
    pub url: String,
    pub number: u64,
    pub files_changed: Vec<String>,
    /// Original contents of the changed files, for review/rollback context.
    pub original_contents: std::collections::BTreeMap<String, String>,
}

/// An ingested application log entry. Immutable after ingest; the pipeline
/// only reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub service_name: String,
    pub severity: LogSeverity,
    pub message: String,
    pub source: String,
    pub user_id: i64,
    pub integration_id: Option<i64>,
    /// Free-form metadata: trace ids, spans, duration, status code, stack
    /// trace events, code paths.
    #[serde(default)]
    pub metadata: Value,
}

/// The central mutable aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub severity: IncidentSeverity,
    pub status: IncidentStatus,
    pub service_name: String,
    pub source: String,
    pub user_id: i64,
    pub integration_id: Option<i64>,
    pub repo_name: Option<String>,
    /// Ordered set of constituent log ids. Unique; order preserved.
    pub log_ids: Vec<i64>,
    pub trigger_event: Option<TriggerEvent>,
    /// Merge of constituent log metadata; new values win on key collision.
    #[serde(default)]
    pub metadata: Value,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub root_cause: Option<String>,
    pub action_taken: Option<String>,
    pub code_fix_explanation: Option<String>,
    pub pr_info: Option<PrInfo>,
}

impl Incident {
    /// Append a log id if not already present. Returns `true` if appended.
    pub fn append_log_id(&mut self, log_id: i64) -> bool {
        if self.log_ids.contains(&log_id) {
            return false;
        }
        self.log_ids.push(log_id);
        true
    }

    /// Advance `last_seen_at`, keeping it monotonic non-decreasing.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen_at {
            self.last_seen_at = now;
        }
    }

    /// Escalate severity upward only. Returns `true` if severity changed.
    pub fn escalate_severity(&mut self, to: IncidentSeverity) -> bool {
        if to > self.severity {
            self.severity = to;
            return true;
        }
        false
    }

    /// Transition status along the DAG, rejecting illegal edges.
    pub fn set_status(&mut self, to: IncidentStatus) -> Result<(), crate::errors::PipelineError> {
        if !self.status.can_transition_to(to) {
            return Err(crate::errors::PipelineError::IllegalStatusTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Merge log metadata into the incident; new values overwrite existing
    /// keys, untouched keys survive.
    pub fn merge_metadata(&mut self, new: &Value) {
        let Some(new_map) = new.as_object() else {
            return;
        };
        if !self.metadata.is_object() {
            self.metadata = Value::Object(serde_json::Map::new());
        }
        if let Some(existing) = self.metadata.as_object_mut() {
            for (k, v) in new_map {
                existing.insert(k.clone(), v.clone());
            }
        }
    }
}

/// An integration row as the core reads it: the provider connection that a
/// log or incident is associated with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationRecord {
    pub id: i64,
    pub user_id: i64,
    /// Provider kind: `github`, `linear`, `slack`, `signoz`, ...
    pub provider: String,
    /// `ACTIVE` / `INACTIVE` / `ERROR`.
    pub status: String,
    #[serde(default)]
    pub config: Value,
    pub project_id: Option<String>,
    pub last_verified: Option<DateTime<Utc>>,
}

impl IntegrationRecord {
    /// Resolve the repository name for a service from this integration's
    /// config, in order: `service_mappings[service]` → `repo_name` →
    /// `repository` → `project_id`.
    pub fn repo_name_for_service(&self, service_name: Option<&str>) -> Option<String> {
        let config = self.config.as_object()?;
        if let Some(service) = service_name {
            if let Some(mappings) = config.get("service_mappings").and_then(Value::as_object) {
                if let Some(repo) = mappings.get(service).and_then(Value::as_str) {
                    if !repo.is_empty() {
                        return Some(repo.to_string());
                    }
                }
            }
        }
        for key in ["repo_name", "repository"] {
            if let Some(repo) = config.get(key).and_then(Value::as_str) {
                if !repo.is_empty() {
                    return Some(repo.to_string());
                }
            }
        }
        self.project_id.clone().filter(|p| !p.is_empty())
    }

    /// Whether this integration's config carries any service mappings.
    /// Integrations without mappings are preferred for auto-assignment.
    pub fn has_service_mappings(&self) -> bool {
        self.config
            .get("service_mappings")
            .and_then(Value::as_object)
            .map(|m| !m.is_empty())
            .unwrap_or(false)
    }
}

/// Granular per-integration health record updated by the reducer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationStatusRecord {
    pub integration_id: i64,
    /// `ACTIVE` / `STALE` / `ERROR`.
    pub status: String,
    pub last_log_time: Option<DateTime<Utc>>,
}
