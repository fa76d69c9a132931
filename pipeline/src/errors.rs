//! Error types shared across the pipeline crate.

/// Errors produced by pipeline components.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("log entry {0} not found")]
    LogNotFound(i64),

    #[error("incident {0} not found")]
    IncidentNotFound(i64),

    #[error("illegal incident status transition: {from} → {to}")]
    IllegalStatusTransition { from: String, to: String },

    #[error("resolution request for incident {incident_id} is {state}, expected {expected}")]
    LedgerConflict {
        incident_id: i64,
        state: String,
        expected: String,
    },

    #[error("plan error: {0}")]
    Plan(String),

    #[error("max replan attempts ({0}) reached")]
    MaxReplansReached(u32),

    #[error("bus publish failed for key `{0}`")]
    PublishFailed(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
