//! Log→Incident reducer.
//!
//! Consumes `process_log_entry` tasks and folds logs into incidents:
//! integration status refresh, severity gating, dedup-window merge or
//! create, metadata merge, severity escalation, ticket creation, and
//! resolution enqueue through the ledger.
//!
//! Race freedom comes from the bus, not locks: all logs for one
//! `(user_id, service_name, source)` land on one partition and are
//! processed serially, so the create-vs-merge check cannot race itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::errors::PipelineResult;
use crate::incident::{
    Incident, IncidentSeverity, IncidentStatus, IntegrationRecord, IntegrationStatusRecord,
    LogEntry, LogSeverity, TriggerEvent,
};
use crate::ledger::ResolutionRequests;
use crate::storage::{IncidentStore, IntegrationStore, LogStore};
use crate::telemetry::ReducerMetrics;

/// Generates a human-readable title and description for a new incident.
/// Implementations call an LLM with a bounded prompt; the reducer falls
/// back to [`fallback_title_description`] on any failure.
#[async_trait]
pub trait TitleGenerator: Send + Sync {
    async fn generate(
        &self,
        log: &LogEntry,
        service_name: &str,
    ) -> anyhow::Result<(String, String)>;
}

/// Deterministic fallback: `"Detected {severity} in {service}"` plus the
/// first 200 characters of the message.
pub fn fallback_title_description(log: &LogEntry) -> (String, String) {
    let title = format!("Detected {} in {}", log.severity, log.service_name);
    let description = if log.message.is_empty() {
        "No error message available".to_string()
    } else {
        log.message.chars().take(200).collect()
    };
    (title, description)
}

/// Identity of a created ticket, persisted into incident metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketIdentity {
    pub id: String,
    pub identifier: String,
    pub url: String,
    pub title: String,
}

/// Creates tickets in the external ticketing system.
#[async_trait]
pub trait TicketCreator: Send + Sync {
    async fn create_ticket(
        &self,
        title: &str,
        description: &str,
        team_id: Option<&str>,
        priority: u8,
    ) -> anyhow::Result<TicketIdentity>;
}

/// Renders the enhanced Markdown description used for tickets. Provided by
/// the adapter layer; the reducer falls back to the plain description.
#[async_trait]
pub trait IncidentDescriber: Send + Sync {
    async fn describe(&self, incident: &Incident, logs: &[LogEntry]) -> String;
}

/// Ticket priority from incident severity (urgent = 0).
pub fn ticket_priority(severity: IncidentSeverity) -> u8 {
    match severity {
        IncidentSeverity::Critical => 0,
        IncidentSeverity::High => 1,
        IncidentSeverity::Medium => 2,
        IncidentSeverity::Low => 3,
    }
}

/// Outcome of one `process_log_entry` task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReducerOutcome {
    LogMissing,
    /// Severity below ERROR; only the integration status was refreshed.
    Ignored,
    Merged { incident_id: i64 },
    Created { incident_id: i64 },
}

/// The reducer service.
pub struct LogReducer {
    logs: Arc<dyn LogStore>,
    incidents: Arc<dyn IncidentStore>,
    integrations: Arc<dyn IntegrationStore>,
    requests: Arc<ResolutionRequests>,
    titles: Arc<dyn TitleGenerator>,
    ticketer: Option<Arc<dyn TicketCreator>>,
    describer: Option<Arc<dyn IncidentDescriber>>,
    config: PipelineConfig,
    metrics: Mutex<ReducerMetrics>,
    /// Test hook: force the synchronous ticket path.
    sync_tickets: bool,
}

impl LogReducer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logs: Arc<dyn LogStore>,
        incidents: Arc<dyn IncidentStore>,
        integrations: Arc<dyn IntegrationStore>,
        requests: Arc<ResolutionRequests>,
        titles: Arc<dyn TitleGenerator>,
        ticketer: Option<Arc<dyn TicketCreator>>,
        describer: Option<Arc<dyn IncidentDescriber>>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            logs,
            incidents,
            integrations,
            requests,
            titles,
            ticketer,
            describer,
            config,
            metrics: Mutex::new(ReducerMetrics::default()),
            sync_tickets: false,
        }
    }

    /// Force synchronous ticket creation (used by tests to observe the
    /// metadata write).
    pub fn with_sync_tickets(mut self) -> Self {
        self.sync_tickets = true;
        self
    }

    pub async fn metrics(&self) -> ReducerMetrics {
        self.metrics.lock().await.clone()
    }

    /// Entry point for `process_log_entry` tasks.
    pub async fn process_log_entry(&self, log_id: i64) -> PipelineResult<ReducerOutcome> {
        let started = Instant::now();
        let outcome = self.process_inner(log_id).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.metrics.lock().await.record_message(elapsed_ms);
        outcome
    }

    async fn process_inner(&self, log_id: i64) -> PipelineResult<ReducerOutcome> {
        let Some(log) = self.logs.get_log(log_id).await? else {
            warn!(log_id, "log not found, skipping");
            return Ok(ReducerOutcome::LogMissing);
        };

        // Per-task integration cache; one batch preload when ids are known.
        let mut cache: HashMap<i64, IntegrationRecord> = HashMap::new();
        if let Some(integration_id) = log.integration_id {
            self.preload_integrations(&[integration_id], &mut cache).await;
        }

        // 1. Integration status refresh happens for every log.
        if let Some(integration_id) = log.integration_id {
            self.integrations
                .upsert_integration_status(IntegrationStatusRecord {
                    integration_id,
                    status: "ACTIVE".to_string(),
                    last_log_time: Some(Utc::now()),
                })
                .await?;
            self.integrations.mark_integration_active(integration_id).await?;
        }

        // 2. Only ERROR and CRITICAL participate in incident logic.
        if !log.severity.is_incident_worthy() {
            return Ok(ReducerOutcome::Ignored);
        }

        // 3. The merge lookup over the dedup window.
        let window_start = Utc::now()
            - ChronoDuration::from_std(self.config.dedup_window)
                .unwrap_or_else(|_| ChronoDuration::seconds(180));
        let existing = self
            .incidents
            .find_open_incident(&log.service_name, &log.source, log.user_id, window_start)
            .await?;

        match existing {
            Some(incident) => self.merge_into(incident, &log, &mut cache).await,
            None => self.create_from(&log, &mut cache).await,
        }
    }

    async fn preload_integrations(
        &self,
        ids: &[i64],
        cache: &mut HashMap<i64, IntegrationRecord>,
    ) {
        let missing: Vec<i64> = ids.iter().copied().filter(|id| !cache.contains_key(id)).collect();
        if missing.is_empty() {
            return;
        }
        match self.integrations.get_integrations(&missing).await {
            Ok(records) => {
                for record in records {
                    cache.insert(record.id, record);
                }
            }
            Err(e) => warn!(error = %e, "integration batch preload failed"),
        }
    }

    async fn cached_integration(
        &self,
        integration_id: i64,
        cache: &mut HashMap<i64, IntegrationRecord>,
    ) -> Option<IntegrationRecord> {
        if let Some(record) = cache.get(&integration_id) {
            self.metrics.lock().await.integration_cache_hits += 1;
            return Some(record.clone());
        }
        self.metrics.lock().await.integration_cache_misses += 1;
        match self.integrations.get_integration(integration_id).await {
            Ok(Some(record)) => {
                cache.insert(integration_id, record.clone());
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(integration_id, error = %e, "integration lookup failed");
                None
            }
        }
    }

    /// First active integration for the user, preferring one whose service
    /// mappings name this service, then one without mappings at all.
    async fn available_integration_for_user(
        &self,
        user_id: i64,
        service_name: &str,
    ) -> Option<IntegrationRecord> {
        let integrations = match self.integrations.active_integrations_for_user(user_id).await {
            Ok(list) => list,
            Err(e) => {
                warn!(user_id, error = %e, "active integration lookup failed");
                return None;
            }
        };
        if integrations.is_empty() {
            return None;
        }
        if let Some(mapped) = integrations.iter().find(|i| {
            i.config
                .get("service_mappings")
                .and_then(|m| m.get(service_name))
                .is_some()
        }) {
            return Some(mapped.clone());
        }
        if let Some(unmapped) = integrations.iter().find(|i| !i.has_service_mappings()) {
            return Some(unmapped.clone());
        }
        integrations.into_iter().next()
    }

    /// Resolve a repo name, falling back to the user's GitHub integration
    /// when the originating integration (e.g. an observability provider)
    /// carries no repository config.
    async fn resolve_repo_name(
        &self,
        integration: Option<&IntegrationRecord>,
        user_id: i64,
        service_name: &str,
    ) -> Option<String> {
        if let Some(repo) =
            integration.and_then(|i| i.repo_name_for_service(Some(service_name)))
        {
            return Some(repo);
        }
        match self.integrations.github_integration_for_user(user_id).await {
            Ok(Some(github)) => github.repo_name_for_service(Some(service_name)),
            Ok(None) => None,
            Err(e) => {
                warn!(user_id, error = %e, "github integration lookup failed");
                None
            }
        }
    }

    async fn merge_into(
        &self,
        mut incident: Incident,
        log: &LogEntry,
        cache: &mut HashMap<i64, IntegrationRecord>,
    ) -> PipelineResult<ReducerOutcome> {
        info!(incident_id = incident.id, log_id = log.id, "merging log into incident");
        incident.touch(Utc::now());
        incident.append_log_id(log.id);

        // Adopt an integration when the incident has none.
        if incident.integration_id.is_none() {
            if let Some(integration_id) = log.integration_id {
                incident.integration_id = Some(integration_id);
            } else if let Some(found) = self
                .available_integration_for_user(log.user_id, &log.service_name)
                .await
            {
                info!(
                    incident_id = incident.id,
                    integration_id = found.id,
                    "auto-assigned integration"
                );
                incident.integration_id = Some(found.id);
                cache.insert(found.id, found);
            }
        }

        // Resolve the repo when still unknown.
        if incident.repo_name.is_none() {
            let integration = match incident.integration_id {
                Some(id) => self.cached_integration(id, cache).await,
                None => None,
            };
            incident.repo_name = self
                .resolve_repo_name(integration.as_ref(), log.user_id, &incident.service_name)
                .await;
            if let Some(repo) = &incident.repo_name {
                info!(incident_id = incident.id, repo, "auto-assigned repo");
            }
        }

        incident.merge_metadata(&log.metadata);

        if log.severity == LogSeverity::Critical {
            incident.escalate_severity(IncidentSeverity::Critical);
        }

        self.incidents.update_incident(&incident).await?;

        if incident.root_cause.is_none() {
            self.requests
                .ensure_incident_resolution_requested(
                    incident.id,
                    incident.user_id,
                    "incident_updated_from_log",
                )
                .await?;
        }

        Ok(ReducerOutcome::Merged {
            incident_id: incident.id,
        })
    }

    async fn create_from(
        &self,
        log: &LogEntry,
        cache: &mut HashMap<i64, IntegrationRecord>,
    ) -> PipelineResult<ReducerOutcome> {
        info!(log_id = log.id, service = %log.service_name, "creating incident");

        let mut integration_id = log.integration_id;
        let mut integration: Option<IntegrationRecord> = None;
        if let Some(id) = integration_id {
            integration = self.cached_integration(id, cache).await;
        } else if let Some(found) = self
            .available_integration_for_user(log.user_id, &log.service_name)
            .await
        {
            integration_id = Some(found.id);
            integration = Some(found);
        }

        let repo_name = match integration_id {
            Some(_) => {
                self.resolve_repo_name(integration.as_ref(), log.user_id, &log.service_name)
                    .await
            }
            None => None,
        };

        let (title, description) = match self.titles.generate(log, &log.service_name).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(log_id = log.id, error = %e, "title generation failed, using fallback");
                fallback_title_description(log)
            }
        };

        let now = Utc::now();
        let incident = Incident {
            id: 0,
            title,
            description,
            severity: if log.severity == LogSeverity::Critical {
                IncidentSeverity::High
            } else {
                IncidentSeverity::Medium
            },
            status: IncidentStatus::Open,
            service_name: log.service_name.clone(),
            source: log.source.clone(),
            user_id: log.user_id,
            integration_id,
            repo_name,
            log_ids: vec![log.id],
            trigger_event: Some(TriggerEvent {
                log_id: log.id,
                message: log.message.clone(),
                level: log.severity,
            }),
            metadata: log.metadata.clone(),
            first_seen_at: now,
            last_seen_at: now,
            created_at: now,
            resolved_at: None,
            root_cause: None,
            action_taken: None,
            code_fix_explanation: None,
            pr_info: None,
        };
        let incident_id = self.incidents.insert_incident(incident).await?;
        let Some(incident) = self.incidents.get_incident(incident_id).await? else {
            return Err(crate::errors::PipelineError::IncidentNotFound(incident_id));
        };

        self.initiate_ticket_creation(&incident).await;

        self.requests
            .ensure_incident_resolution_requested(
                incident_id,
                incident.user_id,
                "incident_created_from_log",
            )
            .await?;

        Ok(ReducerOutcome::Created { incident_id })
    }

    /// Create a ticket when the user has a Linear integration. Prefer the
    /// asynchronous path (spawned task); fall back to synchronous creation
    /// and persist the ticket identity into incident metadata either way.
    async fn initiate_ticket_creation(&self, incident: &Incident) {
        let Some(ticketer) = self.ticketer.clone() else {
            return;
        };
        let linear = match self
            .integrations
            .linear_integration_for_user(incident.user_id)
            .await
        {
            Ok(Some(linear)) => linear,
            Ok(None) => return,
            Err(e) => {
                warn!(incident_id = incident.id, error = %e, "linear integration lookup failed");
                return;
            }
        };
        let team_id = linear
            .config
            .get("team_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let related_logs = self
            .logs
            .get_logs(&incident.log_ids)
            .await
            .unwrap_or_default();
        let description = match &self.describer {
            Some(describer) => describer.describe(incident, &related_logs).await,
            None => incident.description.clone(),
        };
        let priority = ticket_priority(incident.severity);
        let title = format!("Incident: {}", incident.title);

        if self.sync_tickets {
            match ticketer
                .create_ticket(&title, &description, team_id.as_deref(), priority)
                .await
            {
                Ok(identity) => {
                    self.metrics.lock().await.tickets_created_sync += 1;
                    self.persist_ticket_identity(incident.id, &identity).await;
                }
                Err(e) => {
                    warn!(incident_id = incident.id, error = %e, "sync ticket creation failed");
                }
            }
            return;
        }

        let incidents = Arc::clone(&self.incidents);
        let incident_id = incident.id;
        self.metrics.lock().await.tickets_created_async += 1;
        tokio::spawn(async move {
            match ticketer
                .create_ticket(&title, &description, team_id.as_deref(), priority)
                .await
            {
                Ok(identity) => {
                    persist_ticket_identity_on(&incidents, incident_id, &identity).await;
                }
                Err(e) => {
                    warn!(incident_id, error = %e, "async ticket creation failed");
                }
            }
        });
    }

    async fn persist_ticket_identity(&self, incident_id: i64, identity: &TicketIdentity) {
        persist_ticket_identity_on(&self.incidents, incident_id, identity).await;
    }
}

async fn persist_ticket_identity_on(
    incidents: &Arc<dyn IncidentStore>,
    incident_id: i64,
    identity: &TicketIdentity,
) {
    let Ok(Some(mut incident)) = incidents.get_incident(incident_id).await else {
        warn!(incident_id, "cannot persist ticket identity, incident missing");
        return;
    };
    let value = serde_json::to_value(identity).unwrap_or(serde_json::Value::Null);
    incident.merge_metadata(&serde_json::json!({ "linear_issue": value }));
    if let Err(e) = incidents.update_incident(&incident).await {
        warn!(incident_id, error = %e, "failed to persist ticket identity");
    } else {
        info!(incident_id, identifier = %identity.identifier, "ticket identity persisted");
    }
}
