//! Engine configuration from environment variables.

use std::time::Duration;

use pipeline::config::{u32_from_env, u64_from_env};

/// LLM endpoint configuration (OpenAI-compatible chat completions).
#[derive(Debug, Clone)]
pub struct LlmEndpoint {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Primary (expensive) model endpoint, used for analysis and planning
    /// on complex incidents.
    pub primary_llm: LlmEndpoint,
    /// Small model endpoint for cheap classification and title generation.
    pub small_llm: LlmEndpoint,
    /// Per-LLM-request timeout. `LLM_CALL_TIMEOUT` (default: 60 s).
    pub llm_call_timeout: Duration,
    /// One tool-batch execution. `CODE_EXECUTION_TIMEOUT` (default: 30 s).
    pub code_execution_timeout: Duration,
    /// One plan step (LLM + tools). `AGENT_STEP_TIMEOUT` (default: 180 s).
    pub agent_step_timeout: Duration,
    /// Entire agent-loop run. `CREW_EXECUTION_TIMEOUT` (default: 1200 s).
    pub crew_execution_timeout: Duration,
    /// LLM transport timeout. `HTTP_LLM_API_TIMEOUT` (default: 60 s).
    pub http_llm_timeout: Duration,
    /// Repo-host transport timeout. `HTTP_GITHUB_API_TIMEOUT` (default: 30 s).
    pub http_github_timeout: Duration,
    /// Iteration cap for the loop. `MAX_AGENT_ITERATIONS` (default: 50).
    pub max_agent_iterations: u32,
    /// Retry budget for retryable step errors. `MAX_RETRIES_PER_STEP` (default: 3).
    pub max_retries_per_step: u32,
    /// Event stream bound. `MAX_EVENT_STREAM_SIZE` (default: 100).
    pub max_event_stream_size: usize,
    /// Retries for transient LLM transport errors.
    pub llm_max_retries: u32,
    /// Slack signing secrets; any one of them may validate a request.
    pub slack_signing_secrets: Vec<String>,
    /// Scratchpad directory for the local backend.
    pub scratchpad_dir: String,
}

fn endpoint_from_env(prefix: &str, default_model: &str) -> LlmEndpoint {
    LlmEndpoint {
        base_url: std::env::var(format!("{prefix}_URL"))
            .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
        api_key: std::env::var(format!("{prefix}_API_KEY")).unwrap_or_default(),
        model: std::env::var(format!("{prefix}_MODEL"))
            .unwrap_or_else(|_| default_model.into()),
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            primary_llm: endpoint_from_env("HEALOPS_LLM", "claude-sonnet-4-5"),
            small_llm: endpoint_from_env("HEALOPS_SMALL_LLM", "gpt-4o-mini"),
            llm_call_timeout: Duration::from_secs(u64_from_env("LLM_CALL_TIMEOUT", 60)),
            code_execution_timeout: Duration::from_secs(u64_from_env("CODE_EXECUTION_TIMEOUT", 30)),
            agent_step_timeout: Duration::from_secs(u64_from_env("AGENT_STEP_TIMEOUT", 180)),
            crew_execution_timeout: Duration::from_secs(u64_from_env("CREW_EXECUTION_TIMEOUT", 1200)),
            http_llm_timeout: Duration::from_secs(u64_from_env("HTTP_LLM_API_TIMEOUT", 60)),
            http_github_timeout: Duration::from_secs(u64_from_env("HTTP_GITHUB_API_TIMEOUT", 30)),
            max_agent_iterations: u32_from_env("MAX_AGENT_ITERATIONS", 50),
            max_retries_per_step: u32_from_env("MAX_RETRIES_PER_STEP", 3),
            max_event_stream_size: u64_from_env("MAX_EVENT_STREAM_SIZE", 100) as usize,
            llm_max_retries: u32_from_env("HEALOPS_LLM_MAX_RETRIES", 3),
            slack_signing_secrets: std::env::var("SLACK_SIGNING_SECRETS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            scratchpad_dir: std::env::var("SCRATCHPAD_DIR")
                .unwrap_or_else(|_| "/tmp/healops_scratchpads".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_defaults_match_contract() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.llm_call_timeout, Duration::from_secs(60));
        assert_eq!(cfg.code_execution_timeout, Duration::from_secs(30));
        assert_eq!(cfg.agent_step_timeout, Duration::from_secs(180));
        assert_eq!(cfg.crew_execution_timeout, Duration::from_secs(1200));
        assert_eq!(cfg.http_github_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_agent_iterations, 50);
    }
}
