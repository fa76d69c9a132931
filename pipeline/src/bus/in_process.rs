//! In-process partitioned bus.
//!
//! Preserves the broker contract without a broker: each topic owns a fixed
//! set of partitions, each partition is an unbounded channel drained by one
//! consumer task, and a key always hashes to the same partition. Ordering
//! within a key is therefore FIFO; distinct keys may interleave freely.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{MessageBus, TaskEnvelope, TaskHandler, Topic};

/// Default partition count per topic.
const DEFAULT_PARTITIONS: usize = 4;

struct TopicChannels {
    senders: Vec<mpsc::UnboundedSender<TaskEnvelope>>,
    /// Receivers parked here until a consumer is started.
    receivers: Mutex<Vec<Option<mpsc::UnboundedReceiver<TaskEnvelope>>>>,
}

/// Channel-backed bus with per-key FIFO.
pub struct InProcessBus {
    partitions: usize,
    topics: HashMap<Topic, TopicChannels>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let mut topics = HashMap::new();
        for topic in [Topic::Incidents, Topic::Tickets] {
            let mut senders = Vec::with_capacity(partitions);
            let mut receivers = Vec::with_capacity(partitions);
            for _ in 0..partitions {
                let (tx, rx) = mpsc::unbounded_channel();
                senders.push(tx);
                receivers.push(Some(rx));
            }
            topics.insert(
                topic,
                TopicChannels {
                    senders,
                    receivers: Mutex::new(receivers),
                },
            );
        }
        Self { partitions, topics }
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.partitions
    }

    /// Start one consumer task per partition of `topic`, each draining its
    /// partition in order and invoking `handler` for every envelope.
    ///
    /// Returns the spawned join handles; callers keep them for shutdown.
    pub async fn start_consumer(
        &self,
        topic: Topic,
        handler: Arc<dyn TaskHandler>,
    ) -> Vec<JoinHandle<()>> {
        let Some(channels) = self.topics.get(&topic) else {
            return Vec::new();
        };
        let mut guard = channels.receivers.lock().await;
        let mut handles = Vec::new();
        for (partition, slot) in guard.iter_mut().enumerate() {
            let Some(mut rx) = slot.take() else {
                warn!(topic = topic.name(), partition, "consumer already started");
                continue;
            };
            let handler = Arc::clone(&handler);
            let topic_name = topic.name();
            handles.push(tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    debug!(topic = topic_name, partition, "consuming task");
                    handler.handle(envelope).await;
                }
                debug!(topic = topic_name, partition, "partition drained, consumer exiting");
            }));
        }
        handles
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, topic: Topic, key: &str, envelope: TaskEnvelope) -> bool {
        let Some(channels) = self.topics.get(&topic) else {
            warn!(topic = topic.name(), "publish to unknown topic");
            return false;
        };
        let partition = self.partition_for(key);
        match channels.senders[partition].send(envelope) {
            Ok(()) => {
                debug!(topic = topic.name(), partition, key, "task published");
                true
            }
            Err(_) => {
                warn!(topic = topic.name(), partition, key, "partition channel closed");
                false
            }
        }
    }
}
