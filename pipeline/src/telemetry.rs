//! Telemetry: phase tracking for runs and cost accounting for LLM calls.
//!
//! Phases bracket the expensive stages of a resolution run so operators can
//! see where time went; the cost ledger prices each LLM call against a
//! per-model table. The reducer keeps its own lightweight counters.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Phases of one resolution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    RunStart,
    MemoryRetrieveStart,
    MemoryRetrieved,
    KnowledgeIndexStart,
    KnowledgeIndexed,
    PlanCreateStart,
    PlanCreated,
    CrewStart,
    CrewCompleted,
    CrewTimeout,
    CrewFailed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStart => "run_start",
            Self::MemoryRetrieveStart => "memory_retrieve_start",
            Self::MemoryRetrieved => "memory_retrieved",
            Self::KnowledgeIndexStart => "knowledge_index_start",
            Self::KnowledgeIndexed => "knowledge_indexed",
            Self::PlanCreateStart => "plan_create_start",
            Self::PlanCreated => "plan_created",
            Self::CrewStart => "crew_start",
            Self::CrewCompleted => "crew_completed",
            Self::CrewTimeout => "crew_timeout",
            Self::CrewFailed => "crew_failed",
        }
    }
}

/// One recorded phase event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub phase: Phase,
    pub incident_id: i64,
    pub at: DateTime<Utc>,
    /// Set on the closing event of a start/end pair.
    pub duration_ms: Option<u64>,
}

/// Accumulates phase events for one run. Each run gets a fresh id so logs
/// from overlapping runs for the same incident remain separable.
pub struct PhaseTracker {
    incident_id: i64,
    run_id: String,
    run_start: Instant,
    open_phases: HashMap<Phase, Instant>,
    events: Vec<PhaseEvent>,
}

impl PhaseTracker {
    pub fn new(incident_id: i64) -> Self {
        let mut tracker = Self {
            incident_id,
            run_id: uuid::Uuid::new_v4().to_string(),
            run_start: Instant::now(),
            open_phases: HashMap::new(),
            events: Vec::new(),
        };
        tracker.record(Phase::RunStart, None);
        tracker
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn record(&mut self, phase: Phase, duration_ms: Option<u64>) {
        info!(
            incident_id = self.incident_id,
            run_id = %self.run_id,
            phase = phase.as_str(),
            duration_ms,
            "phase"
        );
        self.events.push(PhaseEvent {
            phase,
            incident_id: self.incident_id,
            at: Utc::now(),
            duration_ms,
        });
    }

    /// Open a timed phase; closed by [`Self::finish`] with the matching end
    /// phase.
    pub fn start(&mut self, phase: Phase) {
        self.open_phases.insert(phase, Instant::now());
        self.record(phase, None);
    }

    /// Close a timed phase. `start_phase` identifies the opening mark.
    pub fn finish(&mut self, start_phase: Phase, end_phase: Phase) {
        let duration_ms = self
            .open_phases
            .remove(&start_phase)
            .map(|started| started.elapsed().as_millis() as u64);
        self.record(end_phase, duration_ms);
    }

    /// Record a terminal crew phase stamped with total run duration.
    pub fn crew_ended(&mut self, end_phase: Phase) {
        let total = self.run_start.elapsed().as_millis() as u64;
        self.record(end_phase, Some(total));
    }

    pub fn events(&self) -> &[PhaseEvent] {
        &self.events
    }
}

/// Usage of one LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallCost {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
    pub at: DateTime<Utc>,
}

/// Per-model prices in USD per million tokens (input, output).
#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: HashMap<String, (f64, f64)>,
    /// Applied to unknown models.
    default: (f64, f64),
}

impl Default for PriceTable {
    fn default() -> Self {
        let mut prices = HashMap::new();
        prices.insert("claude-sonnet-4-5".to_string(), (3.0, 15.0));
        prices.insert("claude-haiku-4-5".to_string(), (1.0, 5.0));
        prices.insert("gpt-4o".to_string(), (2.5, 10.0));
        prices.insert("gpt-4o-mini".to_string(), (0.15, 0.6));
        Self {
            prices,
            default: (1.0, 3.0),
        }
    }
}

impl PriceTable {
    pub fn price_for(&self, model: &str) -> (f64, f64) {
        self.prices.get(model).copied().unwrap_or(self.default)
    }
}

/// Accumulates per-call costs across a run.
#[derive(Default)]
pub struct CostLedger {
    calls: Vec<LlmCallCost>,
    prices: PriceTable,
}

impl CostLedger {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            prices: PriceTable::default(),
        }
    }

    pub fn record_call(&mut self, model: &str, input_tokens: u64, output_tokens: u64) {
        let (in_price, out_price) = self.prices.price_for(model);
        let estimated_cost_usd = input_tokens as f64 / 1_000_000.0 * in_price
            + output_tokens as f64 / 1_000_000.0 * out_price;
        self.calls.push(LlmCallCost {
            model: model.to_string(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            estimated_cost_usd,
            at: Utc::now(),
        });
    }

    pub fn calls(&self) -> &[LlmCallCost] {
        &self.calls
    }

    pub fn total_tokens(&self) -> u64 {
        self.calls.iter().map(|c| c.total_tokens).sum()
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.calls.iter().map(|c| c.estimated_cost_usd).sum()
    }
}

/// Rough token estimate: ~3.5 characters per token, conservative for mixed
/// prose and code.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as f64 / 3.5) as u64
}

/// Counters kept by the reducer across messages.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ReducerMetrics {
    pub messages_processed: u64,
    pub total_processing_ms: u64,
    pub integration_cache_hits: u64,
    pub integration_cache_misses: u64,
    pub tickets_created_async: u64,
    pub tickets_created_sync: u64,
}

impl ReducerMetrics {
    pub fn record_message(&mut self, elapsed_ms: u64) {
        self.messages_processed += 1;
        self.total_processing_ms += elapsed_ms;
    }

    pub fn average_processing_ms(&self) -> f64 {
        if self.messages_processed == 0 {
            return 0.0;
        }
        self.total_processing_ms as f64 / self.messages_processed as f64
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let attempts = self.integration_cache_hits + self.integration_cache_misses;
        if attempts == 0 {
            return 0.0;
        }
        self.integration_cache_hits as f64 / attempts as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_pairs_carry_duration() {
        let mut tracker = PhaseTracker::new(1);
        tracker.start(Phase::PlanCreateStart);
        tracker.finish(Phase::PlanCreateStart, Phase::PlanCreated);
        tracker.crew_ended(Phase::CrewCompleted);

        let events = tracker.events();
        assert_eq!(events[0].phase, Phase::RunStart);
        let created = events.iter().find(|e| e.phase == Phase::PlanCreated).unwrap();
        assert!(created.duration_ms.is_some());
        let ended = events.iter().find(|e| e.phase == Phase::CrewCompleted).unwrap();
        assert!(ended.duration_ms.is_some());
    }

    #[test]
    fn cost_ledger_prices_known_and_unknown_models() {
        let mut ledger = CostLedger::new();
        ledger.record_call("gpt-4o-mini", 1_000_000, 1_000_000);
        ledger.record_call("some-unknown-model", 1_000_000, 0);

        assert_eq!(ledger.calls().len(), 2);
        assert_eq!(ledger.total_tokens(), 3_000_000);
        let mini = &ledger.calls()[0];
        assert!((mini.estimated_cost_usd - 0.75).abs() < 1e-9);
        let unknown = &ledger.calls()[1];
        assert!((unknown.estimated_cost_usd - 1.0).abs() < 1e-9);
    }

    #[test]
    fn token_estimate_is_conservative() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a".repeat(35).as_str()), 10);
    }

    #[test]
    fn reducer_metrics_summary() {
        let mut m = ReducerMetrics::default();
        m.record_message(10);
        m.record_message(30);
        m.integration_cache_hits = 3;
        m.integration_cache_misses = 1;
        assert_eq!(m.average_processing_ms(), 20.0);
        assert_eq!(m.cache_hit_rate(), 75.0);
    }
}
