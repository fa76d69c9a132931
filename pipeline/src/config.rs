//! Environment-driven configuration for the pipeline core.
//!
//! Every knob reads an environment variable with a documented default, so a
//! bare process comes up with sane behavior and deployments override only
//! what they need.

use std::time::Duration;

/// Parse a `u64` from the environment, falling back to `default` on absence
/// or parse failure. Zero is rejected (treated as unset).
pub fn u64_from_env(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

/// Parse a `u32` from the environment with the same semantics as [`u64_from_env`].
pub fn u32_from_env(var: &str, default: u32) -> u32 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

/// Parse a boolean from the environment. Accepts `1`, `true`, `yes`, `on`.
pub fn bool_from_env(var: &str, default: bool) -> bool {
    std::env::var(var)
        .ok()
        .map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

/// Core pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Deduplication window for the log→incident reducer.
    /// `INCIDENT_DEDUP_WINDOW_SECS` (default: 180).
    pub dedup_window: Duration,
    /// Maximum events retained in an event stream before compression.
    /// `MAX_EVENT_STREAM_SIZE` (default: 100).
    pub max_event_stream_size: usize,
    /// Maximum replan attempts per incident run. `MAX_REPLANS` (default: 3).
    pub max_replans: u32,
    /// Retry budget for retryable step errors. `MAX_RETRIES_PER_STEP` (default: 3).
    pub max_retries_per_step: u32,
    /// Iteration cap for one agent-loop run. `MAX_AGENT_ITERATIONS` (default: 50).
    pub max_agent_iterations: u32,
    /// Local directory for scratchpad files when no repo backend is used.
    /// `SCRATCHPAD_DIR` (default: `/tmp/healops_scratchpads`).
    pub scratchpad_dir: String,
    /// Truncation bound for ledger `last_error` text.
    pub max_ledger_error_len: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(u64_from_env("INCIDENT_DEDUP_WINDOW_SECS", 180)),
            max_event_stream_size: u64_from_env("MAX_EVENT_STREAM_SIZE", 100) as usize,
            max_replans: u32_from_env("MAX_REPLANS", 3),
            max_retries_per_step: u32_from_env("MAX_RETRIES_PER_STEP", 3),
            max_agent_iterations: u32_from_env("MAX_AGENT_ITERATIONS", 50),
            scratchpad_dir: std::env::var("SCRATCHPAD_DIR")
                .unwrap_or_else(|_| "/tmp/healops_scratchpads".into()),
            max_ledger_error_len: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_spec_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.dedup_window, Duration::from_secs(180));
        assert_eq!(cfg.max_event_stream_size, 100);
        assert_eq!(cfg.max_replans, 3);
        assert_eq!(cfg.max_retries_per_step, 3);
        assert_eq!(cfg.max_agent_iterations, 50);
    }

    #[test]
    fn bool_parsing_accepts_common_forms() {
        assert!(!bool_from_env("HEALOPS_TEST_UNSET_BOOL", false));
        assert!(bool_from_env("HEALOPS_TEST_UNSET_BOOL_2", true));
    }
}
