//! Chronological, size-bounded event log with compression.
//!
//! Single-writer: one agent loop owns one stream. When the stream exceeds
//! `max_events`, the oldest entries collapse into one COMPRESSION event
//! carrying counts by type, the only lossy operation. Entries are never
//! reordered after append.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{AgentEvent, EventType};

/// Append-only event stream for one incident run.
pub struct EventStream {
    incident_id: i64,
    max_events: usize,
    events: Vec<AgentEvent>,
    /// Optional live feed for dashboards; lagging receivers just miss events.
    broadcast: Option<broadcast::Sender<AgentEvent>>,
}

impl EventStream {
    pub fn new(incident_id: i64, max_events: usize) -> Self {
        Self {
            incident_id,
            max_events: max_events.max(1),
            events: Vec::new(),
            broadcast: None,
        }
    }

    /// Attach a broadcast channel; every appended event is also sent there.
    pub fn with_broadcast(mut self, sender: broadcast::Sender<AgentEvent>) -> Self {
        self.broadcast = Some(sender);
        self
    }

    pub fn incident_id(&self) -> i64 {
        self.incident_id
    }

    /// Append an event, compressing older entries when the bound is hit.
    pub fn add_event(&mut self, event_type: EventType, data: Value, agent: Option<&str>) {
        let event = AgentEvent {
            event_type,
            timestamp: Utc::now(),
            agent: agent.map(str::to_string),
            data,
            incident_id: self.incident_id,
        };
        if let Some(sender) = &self.broadcast {
            // No receivers is fine; the stream is the source of truth.
            let _ = sender.send(event.clone());
        }
        self.events.push(event);
        if self.events.len() > self.max_events {
            self.compress_old_events();
        }
    }

    /// Collapse everything except the most recent `max_events` entries into
    /// a single COMPRESSION event carrying a per-type breakdown.
    fn compress_old_events(&mut self) {
        if self.events.len() <= self.max_events {
            return;
        }
        let split = self.events.len() - self.max_events;
        let old: Vec<AgentEvent> = self.events.drain(..split).collect();

        let mut breakdown: BTreeMap<&'static str, u64> = BTreeMap::new();
        for event in &old {
            *breakdown.entry(event.event_type.as_str()).or_insert(0) += 1;
        }
        // Stamped with the newest compressed event so the stream stays in
        // non-decreasing timestamp order.
        let stamp = old.last().map(|e| e.timestamp).unwrap_or_else(Utc::now);
        let compression = AgentEvent {
            event_type: EventType::Compression,
            timestamp: stamp,
            agent: None,
            data: json!({
                "compressed_count": old.len(),
                "breakdown": breakdown,
            }),
            incident_id: self.incident_id,
        };
        debug!(
            incident_id = self.incident_id,
            compressed = old.len(),
            "compressed old events"
        );
        self.events.insert(0, compression);
    }

    /// Last `n` events, oldest first.
    pub fn get_recent_events(&self, n: usize) -> &[AgentEvent] {
        let start = self.events.len().saturating_sub(n);
        &self.events[start..]
    }

    pub fn get_events_by_type(&self, event_type: EventType) -> Vec<&AgentEvent> {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn all_events(&self) -> &[AgentEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last_event(&self) -> Option<&AgentEvent> {
        self.events.last()
    }

    /// Format the most recent events for LLM context, oldest first.
    pub fn to_context_string(&self, max_events: usize) -> String {
        let recent = self.get_recent_events(max_events);
        if recent.is_empty() {
            return "No events yet.".to_string();
        }
        let mut lines = Vec::with_capacity(recent.len());
        for event in recent {
            let mut line = format!(
                "[{}] {}",
                event.timestamp.to_rfc3339(),
                event.event_type.as_str().to_uppercase()
            );
            if let Some(agent) = &event.agent {
                line.push_str(&format!(" by {agent}"));
            }
            let data = serde_json::to_string(&event.data).unwrap_or_else(|_| "{}".into());
            line.push_str(&format!(": {data}"));
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamps_are_non_decreasing() {
        let mut stream = EventStream::new(1, 100);
        for i in 0..25 {
            stream.add_event(EventType::AgentAction, json!({"i": i}), Some("fixer"));
        }
        let events = stream.all_events();
        for pair in events.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn stream_is_bounded_by_max_plus_compression() {
        let mut stream = EventStream::new(1, 10);
        for i in 0..250 {
            stream.add_event(EventType::Observation, json!({"i": i}), None);
        }
        assert!(stream.len() <= 11);
        assert_eq!(stream.all_events()[0].event_type, EventType::Compression);

        // The newest events survive uncompressed.
        let last = stream.last_event().unwrap();
        assert_eq!(last.data["i"], json!(249));
    }

    #[test]
    fn compression_carries_breakdown_by_type() {
        let mut stream = EventStream::new(1, 5);
        for _ in 0..4 {
            stream.add_event(EventType::AgentAction, json!({}), None);
        }
        for _ in 0..4 {
            stream.add_event(EventType::Error, json!({}), None);
        }
        let compression = &stream.all_events()[0];
        assert_eq!(compression.event_type, EventType::Compression);
        let breakdown = &compression.data["breakdown"];
        assert!(breakdown.get("agent_action").is_some());
    }

    #[test]
    fn filter_by_type_and_recent_window() {
        let mut stream = EventStream::new(1, 100);
        stream.add_event(EventType::PlanCreated, json!({"steps": 5}), None);
        stream.add_event(EventType::Error, json!({"message": "boom"}), None);
        stream.add_event(EventType::Error, json!({"message": "boom2"}), None);

        assert_eq!(stream.get_events_by_type(EventType::Error).len(), 2);
        assert_eq!(stream.get_recent_events(2).len(), 2);
        assert_eq!(stream.get_recent_events(50).len(), 3);
    }

    #[test]
    fn context_string_formats_oldest_first() {
        let mut stream = EventStream::new(7, 100);
        stream.add_event(EventType::PlanStepStarted, json!({"step_number": 1}), None);
        stream.add_event(
            EventType::PlanStepCompleted,
            json!({"step_number": 1}),
            Some("coder"),
        );
        let ctx = stream.to_context_string(20);
        let started = ctx.find("PLAN_STEP_STARTED").unwrap();
        let completed = ctx.find("PLAN_STEP_COMPLETED by coder").unwrap();
        assert!(started < completed);
    }

    #[test]
    fn empty_stream_has_placeholder_context() {
        let stream = EventStream::new(1, 10);
        assert_eq!(stream.to_context_string(5), "No events yet.");
    }

    #[test]
    fn broadcast_receives_appends() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut stream = EventStream::new(1, 10).with_broadcast(tx);
        stream.add_event(EventType::UserRequest, json!({"request": "fix"}), None);
        let received = rx.try_recv().unwrap();
        assert_eq!(received.event_type, EventType::UserRequest);
        assert_eq!(received.incident_id, 1);
    }
}
