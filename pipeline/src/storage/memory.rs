//! In-memory storage backend for tests and in-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{IncidentStore, IntegrationStore, LogStore, RunArtifactStore};
use crate::errors::PipelineResult;
use crate::events::AgentEvent;
use crate::incident::{Incident, IncidentStatus, IntegrationRecord, IntegrationStatusRecord, LogEntry};
use crate::planner::PlanStep;
use crate::workspace::WorkspaceRecord;

/// Everything behind one mutex; good enough for tests and single-process
/// runs where the bus already serializes per-incident work.
#[derive(Default)]
pub struct InMemoryStore {
    logs: Mutex<HashMap<i64, LogEntry>>,
    email_logs: Mutex<HashMap<i64, String>>,
    incidents: Mutex<HashMap<i64, Incident>>,
    integrations: Mutex<Vec<IntegrationRecord>>,
    integration_statuses: Mutex<HashMap<i64, IntegrationStatusRecord>>,
    events: Mutex<HashMap<i64, Vec<AgentEvent>>>,
    plans: Mutex<HashMap<i64, Vec<(u32, Vec<PlanStep>)>>>,
    workspaces: Mutex<HashMap<i64, WorkspaceRecord>>,
    next_incident_id: AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            next_incident_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    pub async fn put_log(&self, log: LogEntry) {
        self.logs.lock().await.insert(log.id, log);
    }

    pub async fn put_email_log(&self, id: i64, service_name: &str) {
        self.email_logs.lock().await.insert(id, service_name.to_string());
    }

    pub async fn put_integration(&self, integration: IntegrationRecord) {
        self.integrations.lock().await.push(integration);
    }

    pub async fn integration_status(&self, integration_id: i64) -> Option<IntegrationStatusRecord> {
        self.integration_statuses.lock().await.get(&integration_id).cloned()
    }

    pub async fn events_for(&self, incident_id: i64) -> Vec<AgentEvent> {
        self.events.lock().await.get(&incident_id).cloned().unwrap_or_default()
    }

    pub async fn plan_versions_for(&self, incident_id: i64) -> usize {
        self.plans
            .lock()
            .await
            .get(&incident_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl LogStore for InMemoryStore {
    async fn get_log(&self, log_id: i64) -> PipelineResult<Option<LogEntry>> {
        Ok(self.logs.lock().await.get(&log_id).cloned())
    }

    async fn get_logs(&self, log_ids: &[i64]) -> PipelineResult<Vec<LogEntry>> {
        let logs = self.logs.lock().await;
        Ok(log_ids.iter().filter_map(|id| logs.get(id).cloned()).collect())
    }

    async fn delete_logs_for_service(&self, service_name: &str) -> PipelineResult<u64> {
        let mut logs = self.logs.lock().await;
        let before = logs.len();
        logs.retain(|_, l| l.service_name != service_name);
        Ok((before - logs.len()) as u64)
    }

    async fn count_logs_for_service(&self, service_name: &str) -> PipelineResult<u64> {
        let logs = self.logs.lock().await;
        Ok(logs.values().filter(|l| l.service_name == service_name).count() as u64)
    }

    async fn delete_email_logs_for_service(&self, service_name: &str) -> PipelineResult<u64> {
        let mut email_logs = self.email_logs.lock().await;
        let before = email_logs.len();
        email_logs.retain(|_, svc| svc != service_name);
        Ok((before - email_logs.len()) as u64)
    }
}

#[async_trait]
impl IncidentStore for InMemoryStore {
    async fn find_open_incident(
        &self,
        service_name: &str,
        source: &str,
        user_id: i64,
        window_start: DateTime<Utc>,
    ) -> PipelineResult<Option<Incident>> {
        let incidents = self.incidents.lock().await;
        Ok(incidents
            .values()
            .filter(|i| {
                i.status == IncidentStatus::Open
                    && i.service_name == service_name
                    && i.source == source
                    && i.user_id == user_id
                    && i.last_seen_at >= window_start
            })
            .min_by_key(|i| i.id)
            .cloned())
    }

    async fn get_incident(&self, incident_id: i64) -> PipelineResult<Option<Incident>> {
        Ok(self.incidents.lock().await.get(&incident_id).cloned())
    }

    async fn insert_incident(&self, mut incident: Incident) -> PipelineResult<i64> {
        let id = self.next_incident_id.fetch_add(1, Ordering::SeqCst);
        incident.id = id;
        self.incidents.lock().await.insert(id, incident);
        Ok(id)
    }

    async fn update_incident(&self, incident: &Incident) -> PipelineResult<()> {
        self.incidents.lock().await.insert(incident.id, incident.clone());
        Ok(())
    }

    async fn delete_incidents_for_service(&self, service_name: &str) -> PipelineResult<u64> {
        let mut incidents = self.incidents.lock().await;
        let before = incidents.len();
        incidents.retain(|_, i| i.service_name != service_name);
        Ok((before - incidents.len()) as u64)
    }

    async fn count_incidents_for_service(&self, service_name: &str) -> PipelineResult<u64> {
        let incidents = self.incidents.lock().await;
        Ok(incidents.values().filter(|i| i.service_name == service_name).count() as u64)
    }
}

#[async_trait]
impl IntegrationStore for InMemoryStore {
    async fn get_integration(
        &self,
        integration_id: i64,
    ) -> PipelineResult<Option<IntegrationRecord>> {
        let integrations = self.integrations.lock().await;
        Ok(integrations.iter().find(|i| i.id == integration_id).cloned())
    }

    async fn get_integrations(
        &self,
        integration_ids: &[i64],
    ) -> PipelineResult<Vec<IntegrationRecord>> {
        let integrations = self.integrations.lock().await;
        Ok(integrations
            .iter()
            .filter(|i| integration_ids.contains(&i.id))
            .cloned()
            .collect())
    }

    async fn active_integrations_for_user(
        &self,
        user_id: i64,
    ) -> PipelineResult<Vec<IntegrationRecord>> {
        let integrations = self.integrations.lock().await;
        Ok(integrations
            .iter()
            .filter(|i| i.user_id == user_id && i.status == "ACTIVE")
            .cloned()
            .collect())
    }

    async fn github_integration_for_user(
        &self,
        user_id: i64,
    ) -> PipelineResult<Option<IntegrationRecord>> {
        let integrations = self.integrations.lock().await;
        Ok(integrations
            .iter()
            .find(|i| i.user_id == user_id && i.provider == "github" && i.status == "ACTIVE")
            .cloned())
    }

    async fn linear_integration_for_user(
        &self,
        user_id: i64,
    ) -> PipelineResult<Option<IntegrationRecord>> {
        let integrations = self.integrations.lock().await;
        Ok(integrations
            .iter()
            .find(|i| i.user_id == user_id && i.provider == "linear" && i.status == "ACTIVE")
            .cloned())
    }

    async fn upsert_integration_status(
        &self,
        status: IntegrationStatusRecord,
    ) -> PipelineResult<()> {
        self.integration_statuses
            .lock()
            .await
            .insert(status.integration_id, status);
        Ok(())
    }

    async fn mark_integration_active(&self, integration_id: i64) -> PipelineResult<()> {
        let mut integrations = self.integrations.lock().await;
        if let Some(integration) = integrations.iter_mut().find(|i| i.id == integration_id) {
            if integration.status != "ACTIVE" {
                integration.status = "ACTIVE".to_string();
                integration.last_verified = Some(Utc::now());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RunArtifactStore for InMemoryStore {
    async fn persist_events(
        &self,
        incident_id: i64,
        events: &[AgentEvent],
    ) -> PipelineResult<()> {
        self.events
            .lock()
            .await
            .entry(incident_id)
            .or_default()
            .extend(events.iter().cloned());
        Ok(())
    }

    async fn persist_plan(
        &self,
        incident_id: i64,
        plan: &[PlanStep],
        version: u32,
    ) -> PipelineResult<()> {
        self.plans
            .lock()
            .await
            .entry(incident_id)
            .or_default()
            .push((version, plan.to_vec()));
        Ok(())
    }

    async fn persist_workspace(&self, record: &WorkspaceRecord) -> PipelineResult<()> {
        self.workspaces
            .lock()
            .await
            .insert(record.incident_id, record.clone());
        Ok(())
    }

    async fn load_workspace(
        &self,
        incident_id: i64,
    ) -> PipelineResult<Option<WorkspaceRecord>> {
        Ok(self.workspaces.lock().await.get(&incident_id).cloned())
    }
}
