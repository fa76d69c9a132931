//! The retriever: an in-memory cosine-similarity index over code patterns
//! and past fixes.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::embed::{cosine_similarity, Embedder};
use super::{KnowledgeItem, KnowledgeSource};

struct IndexedItem {
    content: String,
    source: KnowledgeSource,
    metadata: serde_json::Value,
    vector: Vec<f32>,
}

#[derive(Default)]
struct Index {
    items: Vec<IndexedItem>,
    indexed_paths: HashSet<String>,
}

/// Vector search over the code + past-fix corpus.
pub struct KnowledgeRetriever {
    embedder: Arc<dyn Embedder>,
    index: RwLock<Index>,
}

impl KnowledgeRetriever {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            index: RwLock::new(Index::default()),
        }
    }

    /// Index file paths as code patterns. Idempotent: a path already in the
    /// index is skipped, so the backing store may be incrementally
    /// maintained across runs.
    pub async fn index_codebase_patterns(&self, file_paths: &[String]) {
        for path in file_paths {
            {
                let index = self.index.read().await;
                if index.indexed_paths.contains(path) {
                    continue;
                }
            }
            let content = format!("code file: {path}");
            match self.embedder.embed(&content).await {
                Ok(vector) => {
                    let mut index = self.index.write().await;
                    if index.indexed_paths.insert(path.clone()) {
                        index.items.push(IndexedItem {
                            content,
                            source: KnowledgeSource::CodePattern,
                            metadata: json!({ "path": path }),
                            vector,
                        });
                    }
                }
                Err(e) => {
                    warn!(path, error = %e, "failed to index code pattern");
                }
            }
        }
    }

    /// Append past fixes to the index.
    pub async fn index_past_fixes(&self, fixes: &[String]) {
        for fix in fixes {
            match self.embedder.embed(fix).await {
                Ok(vector) => {
                    let mut index = self.index.write().await;
                    index.items.push(IndexedItem {
                        content: fix.clone(),
                        source: KnowledgeSource::PastFix,
                        metadata: json!({}),
                        vector,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to index past fix");
                }
            }
        }
    }

    /// Index free-form documentation snippets.
    pub async fn index_documentation(&self, docs: &[String]) {
        for doc in docs {
            match self.embedder.embed(doc).await {
                Ok(vector) => {
                    let mut index = self.index.write().await;
                    index.items.push(IndexedItem {
                        content: doc.clone(),
                        source: KnowledgeSource::Documentation,
                        metadata: json!({}),
                        vector,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to index documentation");
                }
            }
        }
    }

    /// Top-k items by descending relevance. Empty on any failure.
    pub async fn retrieve_relevant_knowledge(&self, query: &str, k: usize) -> Vec<KnowledgeItem> {
        let query_vector = match self.embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "query embedding failed, returning no knowledge");
                return Vec::new();
            }
        };
        let index = self.index.read().await;
        let mut scored: Vec<KnowledgeItem> = index
            .items
            .iter()
            .map(|item| KnowledgeItem {
                content: item.content.clone(),
                source: item.source,
                relevance_score: cosine_similarity(&query_vector, &item.vector).max(0.0),
                metadata: item.metadata.clone(),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        debug!(query_len = query.len(), returned = scored.len(), "knowledge retrieved");
        scored
    }

    /// Knowledge for plan shaping: root cause plus affected files as one
    /// combined query.
    pub async fn retrieve_for_planning(
        &self,
        root_cause: &str,
        affected_files: &[String],
    ) -> Vec<KnowledgeItem> {
        let query = if affected_files.is_empty() {
            root_cause.to_string()
        } else {
            format!("{root_cause}\nfiles: {}", affected_files.join(", "))
        };
        self.retrieve_relevant_knowledge(&query, 5).await
    }

    pub async fn indexed_count(&self) -> usize {
        self.index.read().await.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::HashEmbedder;

    fn retriever() -> KnowledgeRetriever {
        KnowledgeRetriever::new(Arc::new(HashEmbedder::new()))
    }

    #[tokio::test]
    async fn codebase_indexing_is_idempotent() {
        let kr = retriever();
        let paths = vec!["src/user.ts".to_string(), "src/auth.ts".to_string()];
        kr.index_codebase_patterns(&paths).await;
        kr.index_codebase_patterns(&paths).await;
        assert_eq!(kr.indexed_count().await, 2);
    }

    #[tokio::test]
    async fn retrieval_orders_by_descending_relevance() {
        let kr = retriever();
        kr.index_past_fixes(&[
            "fixed null pointer in user lookup by guarding the session object".to_string(),
            "rotated database credentials after connection failures".to_string(),
            "added retry to flaky webhook delivery".to_string(),
        ])
        .await;

        let items = kr
            .retrieve_relevant_knowledge("null pointer user lookup guard", 3)
            .await;
        assert_eq!(items.len(), 3);
        for pair in items.windows(2) {
            assert!(pair[0].relevance_score >= pair[1].relevance_score);
        }
        assert!(items[0].content.contains("null pointer"));
    }

    #[tokio::test]
    async fn k_truncates_results() {
        let kr = retriever();
        kr.index_past_fixes(&(0..10).map(|i| format!("fix number {i}")).collect::<Vec<_>>())
            .await;
        let items = kr.retrieve_relevant_knowledge("fix", 3).await;
        assert_eq!(items.len(), 3);
    }

    #[tokio::test]
    async fn empty_index_returns_empty() {
        let kr = retriever();
        assert!(kr.retrieve_relevant_knowledge("anything", 5).await.is_empty());
    }

    #[tokio::test]
    async fn planning_retrieval_combines_files() {
        let kr = retriever();
        kr.index_codebase_patterns(&["src/payments/charge.ts".to_string()]).await;
        let items = kr
            .retrieve_for_planning(
                "charge fails on null customer",
                &["src/payments/charge.ts".to_string()],
            )
            .await;
        assert!(!items.is_empty());
        assert_eq!(items[0].source, KnowledgeSource::CodePattern);
    }
}
