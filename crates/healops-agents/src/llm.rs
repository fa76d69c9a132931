//! OpenAI-compatible chat client with retry, timeout, and cost accounting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline::planner::CompletionClient;
use pipeline::telemetry::CostLedger;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::LlmEndpoint;

/// Base delay for the exponential backoff: 2s, 4s, 8s, ...
const BACKOFF_BASE: Duration = Duration::from_secs(2);

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Chat-completions client bound to one endpoint + model.
pub struct ChatClient {
    client: reqwest::Client,
    endpoint: LlmEndpoint,
    call_timeout: Duration,
    max_retries: u32,
    temperature: f32,
    max_tokens: u32,
    costs: Arc<Mutex<CostLedger>>,
}

impl ChatClient {
    pub fn new(
        endpoint: LlmEndpoint,
        transport_timeout: Duration,
        call_timeout: Duration,
        max_retries: u32,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(transport_timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint,
            call_timeout,
            max_retries,
            temperature: 0.3,
            max_tokens: 4096,
            costs: Arc::new(Mutex::new(CostLedger::new())),
        })
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Share one cost ledger across clients so a run's spend is summed in
    /// one place.
    pub fn with_cost_ledger(mut self, costs: Arc<Mutex<CostLedger>>) -> Self {
        self.costs = costs;
        self
    }

    pub fn cost_ledger(&self) -> Arc<Mutex<CostLedger>> {
        Arc::clone(&self.costs)
    }

    pub fn model(&self) -> &str {
        &self.endpoint.model
    }

    fn is_transient(status: Option<reqwest::StatusCode>, error: Option<&reqwest::Error>) -> bool {
        if let Some(status) = status {
            return matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504);
        }
        error
            .map(|e| e.is_timeout() || e.is_connect() || e.is_request())
            .unwrap_or(false)
    }

    async fn send_once(&self, prompt: &str) -> anyhow::Result<String> {
        let url = format!(
            "{}/chat/completions",
            self.endpoint.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.endpoint.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.endpoint.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("llm http {status}: {}", text.chars().take(200).collect::<String>());
        }
        let parsed: ChatResponse = response.json().await?;
        if let Some(usage) = &parsed.usage {
            self.costs.lock().await.record_call(
                &self.endpoint.model,
                usage.prompt_tokens,
                usage.completion_tokens,
            );
        }
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("llm reply had no content"))
    }
}

#[async_trait]
impl CompletionClient for ChatClient {
    /// One completion under `LLM_CALL_TIMEOUT`, with exponential backoff on
    /// transient transport errors (408, 429, 5xx, connection failures).
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let mut backoff = BACKOFF_BASE;
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            let outcome = tokio::time::timeout(self.call_timeout, self.send_once(prompt)).await;
            match outcome {
                Ok(Ok(content)) => {
                    info!(
                        model = %self.endpoint.model,
                        attempt,
                        reply_len = content.len(),
                        "llm call succeeded"
                    );
                    return Ok(content);
                }
                Ok(Err(e)) => {
                    let transient = {
                        let reqwest_err = e.downcast_ref::<reqwest::Error>();
                        let status = reqwest_err.and_then(|re| re.status());
                        Self::is_transient(status, reqwest_err)
                            || e.to_string().contains("429")
                            || e.to_string().contains("503")
                            || e.to_string().contains("502")
                    };
                    if !transient || attempt == self.max_retries {
                        return Err(e);
                    }
                    warn!(model = %self.endpoint.model, attempt, error = %e, "transient llm error, backing off");
                    last_err = Some(e);
                }
                Err(_elapsed) => {
                    let e = anyhow::anyhow!(
                        "llm call timeout after {}s",
                        self.call_timeout.as_secs()
                    );
                    if attempt == self.max_retries {
                        return Err(e);
                    }
                    warn!(model = %self.endpoint.model, attempt, "llm call timed out, backing off");
                    last_err = Some(e);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("llm call failed")))
    }
}

/// Extract a JSON object from a model reply that may wrap it in a fenced
/// block or surrounding prose.
pub fn extract_json_object(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed.to_string());
    }
    // Fenced block first.
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return Some(inner.to_string());
            }
        }
    }
    // First balanced object anywhere.
    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in trimmed[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(trimmed[start..=start + i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bare_object() {
        let out = extract_json_object(r#"{"title": "x"}"#).unwrap();
        assert_eq!(out, r#"{"title": "x"}"#);
    }

    #[test]
    fn extracts_fenced_object() {
        let reply = "Sure!\n```json\n{\"title\": \"Payment worker crash\"}\n```\nHope that helps.";
        let out = extract_json_object(reply).unwrap();
        assert_eq!(out, "{\"title\": \"Payment worker crash\"}");
    }

    #[test]
    fn extracts_embedded_object_with_nesting() {
        let reply = r#"The answer is {"a": {"b": 1}, "c": "with } inside string"} trailing"#;
        let out = extract_json_object(reply).unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["a"]["b"], 1);
    }

    #[test]
    fn no_object_yields_none() {
        assert!(extract_json_object("no json here").is_none());
    }
}
