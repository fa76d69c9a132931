//! PostgreSQL storage backend.
//!
//! The ledger's claim uses a conditional UPDATE with an affected-row check,
//! which is the atomic compare-and-set the protocol requires. Transient
//! failures retry with exponential backoff before surfacing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{error, info, warn};

use super::{IncidentStore, IntegrationStore, LogStore};
use crate::errors::{PipelineError, PipelineResult};
use crate::incident::{
    Incident, IncidentSeverity, IncidentStatus, IntegrationRecord, IntegrationStatusRecord,
    LogEntry, LogSeverity, PrInfo, TriggerEvent,
};
use crate::ledger::{ResolutionLedger, ResolutionRequest, ResolutionState};

/// Retry budget for transient database errors.
const DB_MAX_RETRIES: u32 = 3;
/// Base backoff doubled per attempt.
const DB_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Connection wrapper; the connection task is spawned on construction.
pub struct PostgresStore {
    client: Arc<Client>,
}

impl PostgresStore {
    /// Connect and spawn the connection driver task.
    pub async fn connect(conn_str: &str) -> PipelineResult<Self> {
        let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
            .await
            .map_err(|e| PipelineError::Storage(format!("connect failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres connection terminated");
            }
        });
        info!("postgres store connected");
        Ok(Self {
            client: Arc::new(client),
        })
    }

    async fn with_retry<T, F, Fut>(&self, op_name: &str, mut op: F) -> PipelineResult<T>
    where
        F: FnMut(Arc<Client>) -> Fut,
        Fut: std::future::Future<Output = Result<T, tokio_postgres::Error>>,
    {
        let mut backoff = DB_BACKOFF_BASE;
        let mut last_err: Option<tokio_postgres::Error> = None;
        for attempt in 0..=DB_MAX_RETRIES {
            match op(Arc::clone(&self.client)).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let retryable = e.is_closed();
                    last_err = Some(e);
                    if !retryable || attempt == DB_MAX_RETRIES {
                        break;
                    }
                    warn!(op = op_name, attempt, "db op failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        Err(PipelineError::Storage(format!(
            "{op_name} failed: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

fn severity_from_str(s: &str) -> IncidentSeverity {
    match s {
        "LOW" => IncidentSeverity::Low,
        "HIGH" => IncidentSeverity::High,
        "CRITICAL" => IncidentSeverity::Critical,
        _ => IncidentSeverity::Medium,
    }
}

fn status_from_str(s: &str) -> IncidentStatus {
    match s {
        "INVESTIGATING" => IncidentStatus::Investigating,
        "HEALING" => IncidentStatus::Healing,
        "RESOLVED" => IncidentStatus::Resolved,
        "FAILED" => IncidentStatus::Failed,
        _ => IncidentStatus::Open,
    }
}

fn log_severity_from_str(s: &str) -> LogSeverity {
    match s {
        "TRACE" => LogSeverity::Trace,
        "DEBUG" => LogSeverity::Debug,
        "INFO" => LogSeverity::Info,
        "WARN" => LogSeverity::Warn,
        "ERROR" => LogSeverity::Error,
        "CRITICAL" => LogSeverity::Critical,
        _ => LogSeverity::Unknown,
    }
}

fn resolution_state_from_str(s: &str) -> ResolutionState {
    match s {
        "IN_FLIGHT" => ResolutionState::InFlight,
        "COMPLETED" => ResolutionState::Completed,
        "FAILED" => ResolutionState::Failed,
        _ => ResolutionState::Queued,
    }
}

fn row_to_log(row: &Row) -> LogEntry {
    LogEntry {
        id: row.get("id"),
        timestamp: row.get("timestamp"),
        service_name: row.get("service_name"),
        severity: log_severity_from_str(row.get("severity")),
        message: row.get("message"),
        source: row.get("source"),
        user_id: row.get("user_id"),
        integration_id: row.get("integration_id"),
        metadata: row
            .get::<_, Option<serde_json::Value>>("metadata_json")
            .unwrap_or(serde_json::Value::Null),
    }
}

fn row_to_incident(row: &Row) -> Incident {
    let log_ids: serde_json::Value = row
        .get::<_, Option<serde_json::Value>>("log_ids")
        .unwrap_or(serde_json::Value::Null);
    let log_ids = log_ids
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_i64()).collect())
        .unwrap_or_default();
    let trigger_event = row
        .get::<_, Option<serde_json::Value>>("trigger_event")
        .and_then(|v| serde_json::from_value::<TriggerEvent>(v).ok());
    let pr_info = row
        .get::<_, Option<serde_json::Value>>("pr_info")
        .and_then(|v| serde_json::from_value::<PrInfo>(v).ok());
    Incident {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        severity: severity_from_str(row.get("severity")),
        status: status_from_str(row.get("status")),
        service_name: row.get("service_name"),
        source: row.get("source"),
        user_id: row.get("user_id"),
        integration_id: row.get("integration_id"),
        repo_name: row.get("repo_name"),
        log_ids,
        trigger_event,
        metadata: row
            .get::<_, Option<serde_json::Value>>("metadata_json")
            .unwrap_or(serde_json::Value::Null),
        first_seen_at: row.get("first_seen_at"),
        last_seen_at: row.get("last_seen_at"),
        created_at: row.get("created_at"),
        resolved_at: row.get("resolved_at"),
        root_cause: row.get("root_cause"),
        action_taken: row.get("action_taken"),
        code_fix_explanation: row.get("code_fix_explanation"),
        pr_info,
    }
}

fn row_to_integration(row: &Row) -> IntegrationRecord {
    IntegrationRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        provider: row.get("provider"),
        status: row.get("status"),
        config: row
            .get::<_, Option<serde_json::Value>>("config")
            .unwrap_or(serde_json::Value::Null),
        project_id: row.get("project_id"),
        last_verified: row.get("last_verified"),
    }
}

#[async_trait]
impl LogStore for PostgresStore {
    async fn get_log(&self, log_id: i64) -> PipelineResult<Option<LogEntry>> {
        self.with_retry("get_log", |client| async move {
            let row = client
                .query_opt(
                    "SELECT id, timestamp, service_name, severity, message, source, user_id, \
                     integration_id, metadata_json FROM log_entries WHERE id = $1",
                    &[&log_id],
                )
                .await?;
            Ok(row.as_ref().map(row_to_log))
        })
        .await
    }

    async fn get_logs(&self, log_ids: &[i64]) -> PipelineResult<Vec<LogEntry>> {
        let ids = log_ids.to_vec();
        self.with_retry("get_logs", |client| {
            let ids = ids.clone();
            async move {
                let rows = client
                    .query(
                        "SELECT id, timestamp, service_name, severity, message, source, user_id, \
                         integration_id, metadata_json FROM log_entries \
                         WHERE id = ANY($1) ORDER BY timestamp DESC LIMIT 50",
                        &[&ids],
                    )
                    .await?;
                Ok(rows.iter().map(row_to_log).collect())
            }
        })
        .await
    }

    async fn delete_logs_for_service(&self, service_name: &str) -> PipelineResult<u64> {
        let service = service_name.to_string();
        self.with_retry("delete_logs_for_service", |client| {
            let service = service.clone();
            async move {
                client
                    .execute("DELETE FROM log_entries WHERE service_name = $1", &[&service])
                    .await
            }
        })
        .await
    }

    async fn count_logs_for_service(&self, service_name: &str) -> PipelineResult<u64> {
        let service = service_name.to_string();
        self.with_retry("count_logs_for_service", |client| {
            let service = service.clone();
            async move {
                let row = client
                    .query_one(
                        "SELECT COUNT(*) FROM log_entries WHERE service_name = $1",
                        &[&service],
                    )
                    .await?;
                Ok(row.get::<_, i64>(0) as u64)
            }
        })
        .await
    }

    async fn delete_email_logs_for_service(&self, service_name: &str) -> PipelineResult<u64> {
        let service = service_name.to_string();
        self.with_retry("delete_email_logs_for_service", |client| {
            let service = service.clone();
            async move {
                client
                    .execute("DELETE FROM email_logs WHERE service_name = $1", &[&service])
                    .await
            }
        })
        .await
    }
}

const INCIDENT_COLUMNS: &str = "id, title, description, severity, status, service_name, source, \
     user_id, integration_id, repo_name, log_ids, trigger_event, metadata_json, first_seen_at, \
     last_seen_at, created_at, resolved_at, root_cause, action_taken, code_fix_explanation, pr_info";

#[async_trait]
impl IncidentStore for PostgresStore {
    async fn find_open_incident(
        &self,
        service_name: &str,
        source: &str,
        user_id: i64,
        window_start: DateTime<Utc>,
    ) -> PipelineResult<Option<Incident>> {
        let (service, source) = (service_name.to_string(), source.to_string());
        self.with_retry("find_open_incident", |client| {
            let (service, source) = (service.clone(), source.clone());
            async move {
                let query = format!(
                    "SELECT {INCIDENT_COLUMNS} FROM incidents \
                     WHERE status = 'OPEN' AND service_name = $1 AND source = $2 \
                     AND user_id = $3 AND last_seen_at >= $4 ORDER BY id LIMIT 1"
                );
                let row = client
                    .query_opt(query.as_str(), &[&service, &source, &user_id, &window_start])
                    .await?;
                Ok(row.as_ref().map(row_to_incident))
            }
        })
        .await
    }

    async fn get_incident(&self, incident_id: i64) -> PipelineResult<Option<Incident>> {
        self.with_retry("get_incident", |client| async move {
            let query = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = $1");
            let row = client.query_opt(query.as_str(), &[&incident_id]).await?;
            Ok(row.as_ref().map(row_to_incident))
        })
        .await
    }

    async fn insert_incident(&self, incident: Incident) -> PipelineResult<i64> {
        let incident = Arc::new(incident);
        self.with_retry("insert_incident", |client| {
            let incident = Arc::clone(&incident);
            async move {
                let log_ids = serde_json::to_value(&incident.log_ids)
                    .unwrap_or(serde_json::Value::Null);
                let trigger = incident
                    .trigger_event
                    .as_ref()
                    .and_then(|t| serde_json::to_value(t).ok());
                let row = client
                    .query_one(
                        "INSERT INTO incidents (title, description, severity, status, \
                         service_name, source, user_id, integration_id, repo_name, log_ids, \
                         trigger_event, metadata_json, first_seen_at, last_seen_at, created_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
                         RETURNING id",
                        &[
                            &incident.title,
                            &incident.description,
                            &incident.severity.to_string(),
                            &incident.status.to_string(),
                            &incident.service_name,
                            &incident.source,
                            &incident.user_id,
                            &incident.integration_id,
                            &incident.repo_name,
                            &log_ids,
                            &trigger,
                            &incident.metadata,
                            &incident.first_seen_at,
                            &incident.last_seen_at,
                            &incident.created_at,
                        ],
                    )
                    .await?;
                Ok(row.get::<_, i64>(0))
            }
        })
        .await
    }

    async fn update_incident(&self, incident: &Incident) -> PipelineResult<()> {
        let incident = Arc::new(incident.clone());
        self.with_retry("update_incident", |client| {
            let incident = Arc::clone(&incident);
            async move {
                let log_ids = serde_json::to_value(&incident.log_ids)
                    .unwrap_or(serde_json::Value::Null);
                let pr_info = incident
                    .pr_info
                    .as_ref()
                    .and_then(|p| serde_json::to_value(p).ok());
                client
                    .execute(
                        "UPDATE incidents SET title = $2, description = $3, severity = $4, \
                         status = $5, integration_id = $6, repo_name = $7, log_ids = $8, \
                         metadata_json = $9, last_seen_at = $10, resolved_at = $11, \
                         root_cause = $12, action_taken = $13, code_fix_explanation = $14, \
                         pr_info = $15 WHERE id = $1",
                        &[
                            &incident.id,
                            &incident.title,
                            &incident.description,
                            &incident.severity.to_string(),
                            &incident.status.to_string(),
                            &incident.integration_id,
                            &incident.repo_name,
                            &log_ids,
                            &incident.metadata,
                            &incident.last_seen_at,
                            &incident.resolved_at,
                            &incident.root_cause,
                            &incident.action_taken,
                            &incident.code_fix_explanation,
                            &pr_info,
                        ],
                    )
                    .await?;
                Ok(())
            }
        })
        .await
    }

    async fn delete_incidents_for_service(&self, service_name: &str) -> PipelineResult<u64> {
        let service = service_name.to_string();
        self.with_retry("delete_incidents_for_service", |client| {
            let service = service.clone();
            async move {
                client
                    .execute("DELETE FROM incidents WHERE service_name = $1", &[&service])
                    .await
            }
        })
        .await
    }

    async fn count_incidents_for_service(&self, service_name: &str) -> PipelineResult<u64> {
        let service = service_name.to_string();
        self.with_retry("count_incidents_for_service", |client| {
            let service = service.clone();
            async move {
                let row = client
                    .query_one(
                        "SELECT COUNT(*) FROM incidents WHERE service_name = $1",
                        &[&service],
                    )
                    .await?;
                Ok(row.get::<_, i64>(0) as u64)
            }
        })
        .await
    }
}

#[async_trait]
impl IntegrationStore for PostgresStore {
    async fn get_integration(
        &self,
        integration_id: i64,
    ) -> PipelineResult<Option<IntegrationRecord>> {
        self.with_retry("get_integration", |client| async move {
            let row = client
                .query_opt(
                    "SELECT id, user_id, provider, status, config, project_id, last_verified \
                     FROM integrations WHERE id = $1",
                    &[&integration_id],
                )
                .await?;
            Ok(row.as_ref().map(row_to_integration))
        })
        .await
    }

    async fn get_integrations(
        &self,
        integration_ids: &[i64],
    ) -> PipelineResult<Vec<IntegrationRecord>> {
        let ids = integration_ids.to_vec();
        self.with_retry("get_integrations", |client| {
            let ids = ids.clone();
            async move {
                let rows = client
                    .query(
                        "SELECT id, user_id, provider, status, config, project_id, last_verified \
                         FROM integrations WHERE id = ANY($1)",
                        &[&ids],
                    )
                    .await?;
                Ok(rows.iter().map(row_to_integration).collect())
            }
        })
        .await
    }

    async fn active_integrations_for_user(
        &self,
        user_id: i64,
    ) -> PipelineResult<Vec<IntegrationRecord>> {
        self.with_retry("active_integrations_for_user", |client| async move {
            let rows = client
                .query(
                    "SELECT id, user_id, provider, status, config, project_id, last_verified \
                     FROM integrations WHERE user_id = $1 AND status = 'ACTIVE' ORDER BY id",
                    &[&user_id],
                )
                .await?;
            Ok(rows.iter().map(row_to_integration).collect())
        })
        .await
    }

    async fn github_integration_for_user(
        &self,
        user_id: i64,
    ) -> PipelineResult<Option<IntegrationRecord>> {
        self.with_retry("github_integration_for_user", |client| async move {
            let row = client
                .query_opt(
                    "SELECT id, user_id, provider, status, config, project_id, last_verified \
                     FROM integrations WHERE user_id = $1 AND provider = 'github' \
                     AND status = 'ACTIVE' ORDER BY id LIMIT 1",
                    &[&user_id],
                )
                .await?;
            Ok(row.as_ref().map(row_to_integration))
        })
        .await
    }

    async fn linear_integration_for_user(
        &self,
        user_id: i64,
    ) -> PipelineResult<Option<IntegrationRecord>> {
        self.with_retry("linear_integration_for_user", |client| async move {
            let row = client
                .query_opt(
                    "SELECT id, user_id, provider, status, config, project_id, last_verified \
                     FROM integrations WHERE user_id = $1 AND provider = 'linear' \
                     AND status = 'ACTIVE' ORDER BY id LIMIT 1",
                    &[&user_id],
                )
                .await?;
            Ok(row.as_ref().map(row_to_integration))
        })
        .await
    }

    async fn upsert_integration_status(
        &self,
        status: IntegrationStatusRecord,
    ) -> PipelineResult<()> {
        let status = Arc::new(status);
        self.with_retry("upsert_integration_status", |client| {
            let status = Arc::clone(&status);
            async move {
                client
                    .execute(
                        "INSERT INTO integration_statuses (integration_id, status, last_log_time) \
                         VALUES ($1, $2, $3) \
                         ON CONFLICT (integration_id) \
                         DO UPDATE SET status = $2, last_log_time = $3",
                        &[&status.integration_id, &status.status, &status.last_log_time],
                    )
                    .await?;
                Ok(())
            }
        })
        .await
    }

    async fn mark_integration_active(&self, integration_id: i64) -> PipelineResult<()> {
        self.with_retry("mark_integration_active", |client| async move {
            client
                .execute(
                    "UPDATE integrations SET status = 'ACTIVE', last_verified = NOW() \
                     WHERE id = $1 AND status <> 'ACTIVE'",
                    &[&integration_id],
                )
                .await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ResolutionLedger for PostgresStore {
    async fn upsert_queued(
        &self,
        incident_id: i64,
        requested_by_user_id: i64,
        trigger: &str,
    ) -> PipelineResult<bool> {
        let trigger = trigger.to_string();
        self.with_retry("ledger_upsert_queued", |client| {
            let trigger = trigger.clone();
            async move {
                // Insert fresh, or reset a terminal row; active rows win the
                // conflict and leave the row untouched (0 affected).
                let affected = client
                    .execute(
                        "INSERT INTO resolution_requests \
                         (incident_id, state, requested_by_user_id, requested_by_trigger, \
                          attempts, created_at) \
                         VALUES ($1, 'QUEUED', $2, $3, 0, NOW()) \
                         ON CONFLICT (incident_id) DO UPDATE SET \
                           state = 'QUEUED', requested_by_user_id = $2, \
                           requested_by_trigger = $3, attempts = 0, last_error = NULL, \
                           claimed_at = NULL, completed_at = NULL, created_at = NOW() \
                         WHERE resolution_requests.state IN ('COMPLETED', 'FAILED')",
                        &[&incident_id, &requested_by_user_id, &trigger],
                    )
                    .await?;
                Ok(affected > 0)
            }
        })
        .await
    }

    async fn try_claim(&self, incident_id: i64) -> PipelineResult<bool> {
        self.with_retry("ledger_try_claim", |client| async move {
            let affected = client
                .execute(
                    "UPDATE resolution_requests SET state = 'IN_FLIGHT', \
                     claimed_at = NOW(), attempts = attempts + 1 \
                     WHERE incident_id = $1 AND state = 'QUEUED'",
                    &[&incident_id],
                )
                .await?;
            Ok(affected == 1)
        })
        .await
    }

    async fn mark_completed(&self, incident_id: i64) -> PipelineResult<()> {
        let affected = self
            .with_retry("ledger_mark_completed", |client| async move {
                client
                    .execute(
                        "UPDATE resolution_requests SET state = 'COMPLETED', completed_at = NOW() \
                         WHERE incident_id = $1 AND state = 'IN_FLIGHT'",
                        &[&incident_id],
                    )
                    .await
            })
            .await?;
        if affected != 1 {
            return Err(PipelineError::LedgerConflict {
                incident_id,
                state: "unknown".into(),
                expected: ResolutionState::InFlight.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_failed(&self, incident_id: i64, error: &str) -> PipelineResult<()> {
        let error = crate::ledger::truncate_error(error);
        self.with_retry("ledger_mark_failed", |client| {
            let error = error.clone();
            async move {
                client
                    .execute(
                        "UPDATE resolution_requests SET state = 'FAILED', \
                         last_error = $2, completed_at = NOW() WHERE incident_id = $1",
                        &[&incident_id, &error],
                    )
                    .await?;
                Ok(())
            }
        })
        .await
    }

    async fn get(&self, incident_id: i64) -> PipelineResult<Option<ResolutionRequest>> {
        self.with_retry("ledger_get", |client| async move {
            let row = client
                .query_opt(
                    "SELECT incident_id, state, requested_by_user_id, requested_by_trigger, \
                     attempts, last_error, claimed_at, completed_at, created_at \
                     FROM resolution_requests WHERE incident_id = $1",
                    &[&incident_id],
                )
                .await?;
            Ok(row.map(|row| ResolutionRequest {
                incident_id: row.get("incident_id"),
                state: resolution_state_from_str(row.get("state")),
                requested_by_user_id: row.get("requested_by_user_id"),
                requested_by_trigger: row.get("requested_by_trigger"),
                attempts: row.get::<_, i32>("attempts") as u32,
                last_error: row.get("last_error"),
                claimed_at: row.get("claimed_at"),
                completed_at: row.get("completed_at"),
                created_at: row.get("created_at"),
            }))
        })
        .await
    }
}
