//! Message bus gateway: ordered per-key task delivery.
//!
//! The contract mirrors a topic-partitioned broker: values are UTF-8 JSON
//! task envelopes, delivery is at-least-once, and ordering is preserved
//! within a key. Keying all work for one incident on the same partition
//! gives per-incident FIFO, which the reducer's dedup window relies on.

pub mod in_process;
pub mod task;

use async_trait::async_trait;

pub use in_process::InProcessBus;
pub use task::{IncidentTask, TaskEnvelope, TicketTask};

/// Topics the core publishes to and consumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Incidents,
    Tickets,
}

impl Topic {
    pub fn name(self) -> &'static str {
        match self {
            Self::Incidents => "incidents",
            Self::Tickets => "tickets",
        }
    }
}

/// Publish side of the bus. Returns `true` on successful enqueue; callers
/// treat `false` as a degraded path (log and, where the original did,
/// fall back to inline handling).
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: Topic, key: &str, envelope: TaskEnvelope) -> bool;
}

/// Consumer callback invoked for each task, serialized per partition.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, envelope: TaskEnvelope);
}
