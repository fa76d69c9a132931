//! Storage traits and backends.
//!
//! The reducer and worker talk to these traits; tests and the in-process
//! deployment use the in-memory backend, production uses Postgres. Only the
//! fields the core reads and writes appear here; the wider relational
//! schema belongs to the ingestion service.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::PipelineResult;
use crate::incident::{Incident, IntegrationRecord, IntegrationStatusRecord, LogEntry};

/// Read access to ingested logs.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn get_log(&self, log_id: i64) -> PipelineResult<Option<LogEntry>>;

    async fn get_logs(&self, log_ids: &[i64]) -> PipelineResult<Vec<LogEntry>>;

    /// Logs for a service, newest first. Used by the cleanup command.
    async fn delete_logs_for_service(&self, service_name: &str) -> PipelineResult<u64>;

    /// Count logs for a service (dry-run reporting).
    async fn count_logs_for_service(&self, service_name: &str) -> PipelineResult<u64>;

    /// Email-notification logs are deleted before their incidents.
    async fn delete_email_logs_for_service(&self, service_name: &str) -> PipelineResult<u64>;
}

/// Incident persistence as the core needs it.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// The merge lookup: an OPEN incident for `(service_name, source,
    /// user_id)` seen since `window_start`.
    async fn find_open_incident(
        &self,
        service_name: &str,
        source: &str,
        user_id: i64,
        window_start: DateTime<Utc>,
    ) -> PipelineResult<Option<Incident>>;

    async fn get_incident(&self, incident_id: i64) -> PipelineResult<Option<Incident>>;

    /// Insert and return the assigned id.
    async fn insert_incident(&self, incident: Incident) -> PipelineResult<i64>;

    async fn update_incident(&self, incident: &Incident) -> PipelineResult<()>;

    async fn delete_incidents_for_service(&self, service_name: &str) -> PipelineResult<u64>;

    async fn count_incidents_for_service(&self, service_name: &str) -> PipelineResult<u64>;
}

/// Integration rows and their granular status records.
#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn get_integration(&self, integration_id: i64)
        -> PipelineResult<Option<IntegrationRecord>>;

    async fn get_integrations(
        &self,
        integration_ids: &[i64],
    ) -> PipelineResult<Vec<IntegrationRecord>>;

    /// Active integrations for a user, insertion order.
    async fn active_integrations_for_user(
        &self,
        user_id: i64,
    ) -> PipelineResult<Vec<IntegrationRecord>>;

    /// The user's GitHub integration, if any.
    async fn github_integration_for_user(
        &self,
        user_id: i64,
    ) -> PipelineResult<Option<IntegrationRecord>>;

    /// The user's Linear integration, if any.
    async fn linear_integration_for_user(
        &self,
        user_id: i64,
    ) -> PipelineResult<Option<IntegrationRecord>>;

    /// Mark an integration ACTIVE and record when it last saw a log.
    async fn upsert_integration_status(
        &self,
        status: IntegrationStatusRecord,
    ) -> PipelineResult<()>;

    /// Flip the integration row itself to ACTIVE when it is not already.
    async fn mark_integration_active(&self, integration_id: i64) -> PipelineResult<()>;
}

/// Persisted run artifacts for debugging and learning: events, plan
/// versions, workspace snapshots.
#[async_trait]
pub trait RunArtifactStore: Send + Sync {
    async fn persist_events(
        &self,
        incident_id: i64,
        events: &[crate::events::AgentEvent],
    ) -> PipelineResult<()>;

    async fn persist_plan(
        &self,
        incident_id: i64,
        plan: &[crate::planner::PlanStep],
        version: u32,
    ) -> PipelineResult<()>;

    async fn persist_workspace(
        &self,
        record: &crate::workspace::WorkspaceRecord,
    ) -> PipelineResult<()>;

    async fn load_workspace(
        &self,
        incident_id: i64,
    ) -> PipelineResult<Option<crate::workspace::WorkspaceRecord>>;
}
