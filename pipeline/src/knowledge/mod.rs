//! Knowledge: a vector-indexed store of code patterns and past fixes.
//!
//! Consulted by the planner (for plan shaping) and by the agent loop (per
//! step). Retrieval never fails loudly: any error degrades to an empty
//! result set so the loop proceeds without knowledge.

pub mod embed;
pub mod retriever;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use embed::{Embedder, HashEmbedder, HttpEmbedder};
pub use retriever::KnowledgeRetriever;

/// Where a knowledge item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeSource {
    PastFix,
    CodePattern,
    Documentation,
}

impl std::fmt::Display for KnowledgeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PastFix => "past_fix",
            Self::CodePattern => "code_pattern",
            Self::Documentation => "documentation",
        };
        write!(f, "{s}")
    }
}

/// A retrieved knowledge item, ordered by descending relevance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub content: String,
    pub source: KnowledgeSource,
    /// 0..=1 cosine similarity against the query.
    pub relevance_score: f32,
    #[serde(default)]
    pub metadata: Value,
}
