//! In-memory memory store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{
    FixRecord, LearningPattern, MemoryContext, MemoryRecord, MemoryStore, PastError,
    WorkspaceContext,
};

/// Confidence baseline for a pattern's first observation.
const BASE_CONFIDENCE: u8 = 30;
/// Confidence gained per additional consistent observation.
const CONFIDENCE_STEP: u8 = 10;

#[derive(Default)]
struct Inner {
    records: HashMap<String, MemoryRecord>,
    patterns: HashMap<String, LearningPattern>,
}

/// Mutex-guarded map store.
#[derive(Default)]
pub struct InMemoryMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn merge_unique(target: &mut Vec<String>, source: &[String]) {
    for item in source {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn retrieve_context(&self, fingerprint: &str) -> anyhow::Result<MemoryContext> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .get(fingerprint)
            .map(|r| MemoryContext {
                known_fixes: r.known_fixes.clone(),
                past_errors: r.past_errors.clone(),
            })
            .unwrap_or_default())
    }

    async fn store_fix(
        &self,
        fingerprint: &str,
        description: &str,
        patch: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .entry(fingerprint.to_string())
            .or_insert_with(|| MemoryRecord {
                fingerprint: fingerprint.to_string(),
                ..MemoryRecord::default()
            });
        let exists = record
            .known_fixes
            .iter()
            .any(|f| f.description == description && f.patch == patch);
        if !exists {
            record.known_fixes.push(FixRecord {
                description: description.to_string(),
                patch: patch.to_string(),
                incident_id: None,
                stored_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn store_fix_with_workspace(
        &self,
        fingerprint: &str,
        description: &str,
        patch: &str,
        workspace_context: WorkspaceContext,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .entry(fingerprint.to_string())
            .or_insert_with(|| MemoryRecord {
                fingerprint: fingerprint.to_string(),
                ..MemoryRecord::default()
            });
        let exists = record
            .known_fixes
            .iter()
            .any(|f| f.description == description && f.patch == patch);
        if !exists {
            record.known_fixes.push(FixRecord {
                description: description.to_string(),
                patch: patch.to_string(),
                incident_id: Some(workspace_context.incident_id),
                stored_at: Utc::now(),
            });
        }
        merge_unique(&mut record.typical_files_read, &workspace_context.files_read);
        merge_unique(
            &mut record.typical_files_modified,
            &workspace_context.files_modified,
        );
        record.confidence_score = record
            .confidence_score
            .saturating_add(CONFIDENCE_STEP)
            .max(BASE_CONFIDENCE)
            .min(100);

        let error_type = record.error_type.clone();
        if !error_type.is_empty() {
            let pattern = inner
                .patterns
                .entry(error_type.clone())
                .or_insert_with(|| LearningPattern {
                    error_type,
                    ..LearningPattern::default()
                });
            merge_unique(&mut pattern.typical_files_read, &workspace_context.files_read);
            merge_unique(
                &mut pattern.typical_files_modified,
                &workspace_context.files_modified,
            );
            pattern.observations += 1;
            pattern.confidence_score = BASE_CONFIDENCE
                .saturating_add(CONFIDENCE_STEP.saturating_mul(pattern.observations.min(7) as u8))
                .min(100);
        }
        Ok(())
    }

    async fn store_error_context(&self, fingerprint: &str, context: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .entry(fingerprint.to_string())
            .or_insert_with(|| MemoryRecord {
                fingerprint: fingerprint.to_string(),
                ..MemoryRecord::default()
            });
        record.past_errors.push(PastError {
            context: context.to_string(),
            occurred_at: Utc::now(),
        });
        Ok(())
    }

    async fn set_error_type(&self, fingerprint: &str, error_type: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .entry(fingerprint.to_string())
            .or_insert_with(|| MemoryRecord {
                fingerprint: fingerprint.to_string(),
                ..MemoryRecord::default()
            });
        record.error_type = error_type.to_string();
        Ok(())
    }

    async fn get_learning_pattern(
        &self,
        error_type: &str,
    ) -> anyhow::Result<Option<LearningPattern>> {
        let inner = self.inner.lock().await;
        Ok(inner.patterns.get(error_type).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_then_retrieve_round_trip() {
        let store = InMemoryMemoryStore::new();
        store.store_fix("fp1", "add null guard", "--- patch ---").await.unwrap();
        let ctx = store.retrieve_context("fp1").await.unwrap();
        assert_eq!(ctx.known_fixes.len(), 1);
        assert_eq!(ctx.known_fixes[0].description, "add null guard");
    }

    #[tokio::test]
    async fn store_fix_is_idempotent() {
        let store = InMemoryMemoryStore::new();
        store.store_fix("fp1", "guard", "p").await.unwrap();
        store.store_fix("fp1", "guard", "p").await.unwrap();
        store.store_fix("fp1", "guard", "different patch").await.unwrap();
        let ctx = store.retrieve_context("fp1").await.unwrap();
        assert_eq!(ctx.known_fixes.len(), 2);
    }

    #[tokio::test]
    async fn unknown_fingerprint_is_empty_not_error() {
        let store = InMemoryMemoryStore::new();
        let ctx = store.retrieve_context("nope").await.unwrap();
        assert!(ctx.known_fixes.is_empty());
    }

    #[tokio::test]
    async fn workspace_context_builds_learning_pattern() {
        let store = InMemoryMemoryStore::new();
        store.set_error_type("fp1", "null_reference_abc").await.unwrap();

        let ws = WorkspaceContext {
            files_read: vec!["src/a.ts".into(), "src/b.ts".into()],
            files_modified: vec!["src/a.ts".into()],
            context_files: vec![],
            changes: vec!["guarded user lookup".into()],
            incident_id: 9,
        };
        store
            .store_fix_with_workspace("fp1", "guard", "patch", ws.clone())
            .await
            .unwrap();
        store
            .store_fix_with_workspace("fp1", "guard2", "patch2", ws)
            .await
            .unwrap();

        let pattern = store
            .get_learning_pattern("null_reference_abc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pattern.observations, 2);
        assert_eq!(pattern.typical_files_read, vec!["src/a.ts", "src/b.ts"]);
        assert_eq!(pattern.typical_files_modified, vec!["src/a.ts"]);
        assert!(pattern.confidence_score >= 50);
        assert!(pattern.confidence_score <= 100);

        assert!(store.get_learning_pattern("other_zzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_contexts_accumulate() {
        let store = InMemoryMemoryStore::new();
        store.store_error_context("fp1", "stack trace A").await.unwrap();
        store.store_error_context("fp1", "stack trace B").await.unwrap();
        let ctx = store.retrieve_context("fp1").await.unwrap();
        assert_eq!(ctx.past_errors.len(), 2);
    }
}
