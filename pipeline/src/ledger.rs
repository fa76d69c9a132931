//! Resolution request ledger: the at-most-one-in-flight claim protocol.
//!
//! One row per incident tracks the lifecycle of its resolution attempt:
//!
//! ```text
//! QUEUED → IN_FLIGHT → {COMPLETED, FAILED}
//! QUEUED → FAILED
//! ```
//!
//! The QUEUED→IN_FLIGHT claim is the only cross-worker synchronization
//! primitive in the system: a worker handling `resolve_incident` must claim
//! first and drop the task on a lost race.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bus::{IncidentTask, MessageBus, TaskEnvelope, Topic};
use crate::errors::{PipelineError, PipelineResult};

/// Ledger row state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolutionState {
    Queued,
    InFlight,
    Completed,
    Failed,
}

impl ResolutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::InFlight => "IN_FLIGHT",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// One resolution request row. At most one per incident exists at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionRequest {
    pub incident_id: i64,
    pub state: ResolutionState,
    pub requested_by_user_id: i64,
    pub requested_by_trigger: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Storage for ledger rows. All state changes are compare-and-set; the
/// in-memory implementation serializes through one mutex, the Postgres
/// implementation through conditional UPDATEs.
#[async_trait]
pub trait ResolutionLedger: Send + Sync {
    /// Insert a QUEUED row, or reset a terminal row to QUEUED. Returns
    /// `true` when a fresh QUEUED row now exists (caller should publish),
    /// `false` when an active row (QUEUED or IN_FLIGHT) already covers the
    /// incident.
    async fn upsert_queued(
        &self,
        incident_id: i64,
        requested_by_user_id: i64,
        trigger: &str,
    ) -> PipelineResult<bool>;

    /// Atomic QUEUED→IN_FLIGHT. Exactly one concurrent caller wins.
    async fn try_claim(&self, incident_id: i64) -> PipelineResult<bool>;

    /// IN_FLIGHT→COMPLETED.
    async fn mark_completed(&self, incident_id: i64) -> PipelineResult<()>;

    /// any→FAILED with a truncated error message.
    async fn mark_failed(&self, incident_id: i64, error: &str) -> PipelineResult<()>;

    async fn get(&self, incident_id: i64) -> PipelineResult<Option<ResolutionRequest>>;
}

/// Bound for `last_error` text stored on the row.
const MAX_ERROR_LEN: usize = 500;

pub(crate) fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let mut cut = MAX_ERROR_LEN;
    while !error.is_char_boundary(cut) {
        cut -= 1;
    }
    error[..cut].to_string()
}

/// Mutex-guarded map implementation, suitable for tests and in-process
/// deployments.
#[derive(Default)]
pub struct InMemoryLedger {
    rows: Mutex<HashMap<i64, ResolutionRequest>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResolutionLedger for InMemoryLedger {
    async fn upsert_queued(
        &self,
        incident_id: i64,
        requested_by_user_id: i64,
        trigger: &str,
    ) -> PipelineResult<bool> {
        let mut rows = self.rows.lock().await;
        match rows.get(&incident_id) {
            Some(row) if !row.state.is_terminal() => Ok(false),
            _ => {
                rows.insert(
                    incident_id,
                    ResolutionRequest {
                        incident_id,
                        state: ResolutionState::Queued,
                        requested_by_user_id,
                        requested_by_trigger: trigger.to_string(),
                        attempts: 0,
                        last_error: None,
                        claimed_at: None,
                        completed_at: None,
                        created_at: Utc::now(),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn try_claim(&self, incident_id: i64) -> PipelineResult<bool> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&incident_id) {
            Some(row) if row.state == ResolutionState::Queued => {
                row.state = ResolutionState::InFlight;
                row.claimed_at = Some(Utc::now());
                row.attempts += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(&self, incident_id: i64) -> PipelineResult<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(&incident_id)
            .ok_or(PipelineError::IncidentNotFound(incident_id))?;
        if row.state != ResolutionState::InFlight {
            return Err(PipelineError::LedgerConflict {
                incident_id,
                state: row.state.to_string(),
                expected: ResolutionState::InFlight.to_string(),
            });
        }
        row.state = ResolutionState::Completed;
        row.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, incident_id: i64, error: &str) -> PipelineResult<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(&incident_id)
            .ok_or(PipelineError::IncidentNotFound(incident_id))?;
        row.state = ResolutionState::Failed;
        row.last_error = Some(truncate_error(error));
        row.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn get(&self, incident_id: i64) -> PipelineResult<Option<ResolutionRequest>> {
        Ok(self.rows.lock().await.get(&incident_id).cloned())
    }
}

/// Ledger-fronted request service: the only path that enqueues
/// `resolve_incident` tasks.
pub struct ResolutionRequests {
    ledger: Arc<dyn ResolutionLedger>,
    bus: Arc<dyn MessageBus>,
}

impl ResolutionRequests {
    pub fn new(ledger: Arc<dyn ResolutionLedger>, bus: Arc<dyn MessageBus>) -> Self {
        Self { ledger, bus }
    }

    pub fn ledger(&self) -> &Arc<dyn ResolutionLedger> {
        &self.ledger
    }

    /// Ensure a resolution request exists and a `resolve_incident` task is
    /// on the bus. Idempotent while a request is QUEUED or IN_FLIGHT.
    /// Returns whether a new task was published.
    pub async fn ensure_incident_resolution_requested(
        &self,
        incident_id: i64,
        requested_by_user_id: i64,
        trigger: &str,
    ) -> PipelineResult<bool> {
        let fresh = self
            .ledger
            .upsert_queued(incident_id, requested_by_user_id, trigger)
            .await?;
        if !fresh {
            info!(incident_id, trigger, "resolution already requested, skipping publish");
            return Ok(false);
        }
        let task = IncidentTask::ResolveIncident {
            incident_id,
            requested_by_user_id,
        };
        let key = task.partition_key();
        let published = self
            .bus
            .publish(Topic::Incidents, &key, TaskEnvelope::incident(task))
            .await;
        if !published {
            // Leave the row QUEUED: the next ensure call will republish
            // after the row is failed out, and the bus may recover.
            warn!(incident_id, "failed to publish resolve_incident task");
            self.ledger
                .mark_failed(incident_id, "publish_failed")
                .await?;
            return Err(PipelineError::PublishFailed(key));
        }
        info!(incident_id, trigger, "resolve_incident task published");
        Ok(true)
    }

    pub async fn try_claim_incident_resolution(&self, incident_id: i64) -> PipelineResult<bool> {
        self.ledger.try_claim(incident_id).await
    }

    pub async fn mark_incident_resolution_completed(
        &self,
        incident_id: i64,
    ) -> PipelineResult<()> {
        self.ledger.mark_completed(incident_id).await
    }

    pub async fn mark_incident_resolution_failed(
        &self,
        incident_id: i64,
        error: &str,
    ) -> PipelineResult<()> {
        self.ledger.mark_failed(incident_id, error).await
    }
}
