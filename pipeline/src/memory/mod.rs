//! Memory: the persistent per-fingerprint record of prior outcomes.
//!
//! Consulted for warm starts (known fixes, past error context) and updated
//! after successful runs (learning patterns: which files this class of
//! error typically needs read and modified). Memory must never block an
//! incident: the [`FailsafeMemory`] wrapper downgrades every failure to an
//! empty result with a warning.

mod store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

pub use store::InMemoryMemoryStore;

/// A fix recorded from a prior successful resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixRecord {
    pub description: String,
    pub patch: String,
    pub incident_id: Option<i64>,
    pub stored_at: DateTime<Utc>,
}

/// Error context captured from a prior occurrence of the same fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PastError {
    pub context: String,
    pub occurred_at: DateTime<Utc>,
}

/// The per-fingerprint memory row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub fingerprint: String,
    pub error_type: String,
    pub known_fixes: Vec<FixRecord>,
    pub past_errors: Vec<PastError>,
    pub typical_files_read: Vec<String>,
    pub typical_files_modified: Vec<String>,
    /// 0..=100; grows with consistent observations.
    pub confidence_score: u8,
}

/// Aggregated learning pattern for an error type, independent of the exact
/// fingerprint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningPattern {
    pub error_type: String,
    pub typical_files_read: Vec<String>,
    pub typical_files_modified: Vec<String>,
    pub confidence_score: u8,
    pub observations: u32,
}

/// Workspace-derived context stored alongside a fix for learning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceContext {
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub context_files: Vec<String>,
    pub changes: Vec<String>,
    pub incident_id: i64,
}

/// Retrieval result for a fingerprint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryContext {
    pub known_fixes: Vec<FixRecord>,
    pub past_errors: Vec<PastError>,
}

/// Persistent memory operations.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn retrieve_context(&self, fingerprint: &str) -> anyhow::Result<MemoryContext>;

    /// Idempotent append: storing an identical (description, patch) pair
    /// again is a no-op.
    async fn store_fix(
        &self,
        fingerprint: &str,
        description: &str,
        patch: &str,
    ) -> anyhow::Result<()>;

    /// Store a fix plus its workspace context, updating the learning
    /// pattern for the record's error type.
    async fn store_fix_with_workspace(
        &self,
        fingerprint: &str,
        description: &str,
        patch: &str,
        workspace_context: WorkspaceContext,
    ) -> anyhow::Result<()>;

    /// Record a past-error context for the fingerprint.
    async fn store_error_context(&self, fingerprint: &str, context: &str) -> anyhow::Result<()>;

    /// Set the error type classification for a fingerprint.
    async fn set_error_type(&self, fingerprint: &str, error_type: &str) -> anyhow::Result<()>;

    async fn get_learning_pattern(
        &self,
        error_type: &str,
    ) -> anyhow::Result<Option<LearningPattern>>;
}

/// Swallow-and-log wrapper: callers proceed without memory rather than
/// blocking the incident.
pub struct FailsafeMemory {
    inner: Arc<dyn MemoryStore>,
}

impl FailsafeMemory {
    pub fn new(inner: Arc<dyn MemoryStore>) -> Self {
        Self { inner }
    }

    pub async fn retrieve_context(&self, fingerprint: &str) -> MemoryContext {
        match self.inner.retrieve_context(fingerprint).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(fingerprint, error = %e, "memory retrieval failed, proceeding without");
                MemoryContext::default()
            }
        }
    }

    pub async fn store_fix(&self, fingerprint: &str, description: &str, patch: &str) {
        if let Err(e) = self.inner.store_fix(fingerprint, description, patch).await {
            warn!(fingerprint, error = %e, "memory store_fix failed");
        }
    }

    pub async fn store_fix_with_workspace(
        &self,
        fingerprint: &str,
        description: &str,
        patch: &str,
        workspace_context: WorkspaceContext,
    ) {
        if let Err(e) = self
            .inner
            .store_fix_with_workspace(fingerprint, description, patch, workspace_context)
            .await
        {
            warn!(fingerprint, error = %e, "memory store_fix_with_workspace failed");
        }
    }

    pub async fn store_error_context(&self, fingerprint: &str, context: &str) {
        if let Err(e) = self.inner.store_error_context(fingerprint, context).await {
            warn!(fingerprint, error = %e, "memory store_error_context failed");
        }
    }

    pub async fn set_error_type(&self, fingerprint: &str, error_type: &str) {
        if let Err(e) = self.inner.set_error_type(fingerprint, error_type).await {
            warn!(fingerprint, error = %e, "memory set_error_type failed");
        }
    }

    pub async fn get_learning_pattern(&self, error_type: &str) -> Option<LearningPattern> {
        match self.inner.get_learning_pattern(error_type).await {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(error_type, error = %e, "learning pattern lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    #[async_trait]
    impl MemoryStore for BrokenStore {
        async fn retrieve_context(&self, _: &str) -> anyhow::Result<MemoryContext> {
            anyhow::bail!("db down")
        }
        async fn store_fix(&self, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("db down")
        }
        async fn store_fix_with_workspace(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: WorkspaceContext,
        ) -> anyhow::Result<()> {
            anyhow::bail!("db down")
        }
        async fn store_error_context(&self, _: &str, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("db down")
        }
        async fn set_error_type(&self, _: &str, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("db down")
        }
        async fn get_learning_pattern(&self, _: &str) -> anyhow::Result<Option<LearningPattern>> {
            anyhow::bail!("db down")
        }
    }

    #[tokio::test]
    async fn failsafe_degrades_to_empty_results() {
        let memory = FailsafeMemory::new(Arc::new(BrokenStore));
        let ctx = memory.retrieve_context("abc").await;
        assert!(ctx.known_fixes.is_empty());
        assert!(ctx.past_errors.is_empty());
        assert!(memory.get_learning_pattern("timeout_x").await.is_none());
        // Writes swallow errors.
        memory.store_fix("abc", "d", "p").await;
    }
}
