//! AI analysis: incident titles, root-cause analysis, and model routing.

use async_trait::async_trait;
use pipeline::incident::{Incident, LogEntry};
use pipeline::planner::CompletionClient;
use pipeline::reducer::{fallback_title_description, TitleGenerator};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::classifier::collect_stack_traces;
use crate::llm::extract_json_object;

#[derive(Deserialize)]
struct TitleReply {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

/// Title generator backed by the small model. Every failure mode falls back
/// to the deterministic `"Detected {severity} in {service}"` shape.
pub struct LlmTitleGenerator {
    llm: Arc<dyn CompletionClient>,
}

impl LlmTitleGenerator {
    pub fn new(llm: Arc<dyn CompletionClient>) -> Self {
        Self { llm }
    }

    fn parse_reply(reply: &str) -> Option<(String, String)> {
        if let Some(json) = extract_json_object(reply) {
            if let Ok(parsed) = serde_json::from_str::<TitleReply>(&json) {
                let title = parsed.title.trim().to_string();
                let description = parsed.description.trim().to_string();
                if !title.is_empty()
                    && title.chars().count() <= 150
                    && !description.is_empty()
                    && description.chars().count() <= 500
                {
                    return Some((title, description));
                }
            }
        }
        // Plain-text "Title: ... Description: ..." replies.
        let title_idx = reply.find("Title:").or_else(|| reply.find("title:"))?;
        let desc_idx = reply
            .find("Description:")
            .or_else(|| reply.find("description:"))?;
        if desc_idx <= title_idx {
            return None;
        }
        let title = reply[title_idx + 6..desc_idx]
            .trim()
            .trim_end_matches(['\n', '-'])
            .trim()
            .to_string();
        let description = reply[desc_idx + 12..]
            .trim()
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        if title.is_empty() || description.is_empty() || title.chars().count() > 150 {
            return None;
        }
        Some((title, description))
    }
}

#[async_trait]
impl TitleGenerator for LlmTitleGenerator {
    async fn generate(
        &self,
        log: &LogEntry,
        service_name: &str,
    ) -> anyhow::Result<(String, String)> {
        let message: String = log.message.chars().take(1000).collect();
        let prompt = format!(
            "Analyze the following error log and generate a clear, meaningful title and \
             description for an incident.\n\n\
             Error Log:\nService: {service_name}\nSeverity: {}\nMessage: {message}\n\n\
             Generate:\n\
             1. A concise title (max 80 characters) that clearly describes what went wrong\n\
             2. A brief description (max 300 characters) explaining the issue in \
             user-friendly terms\n\n\
             Format your response as JSON:\n\
             {{\"title\": \"...\", \"description\": \"...\"}}",
            log.severity
        );
        match self.llm.complete(&prompt).await {
            Ok(reply) => match Self::parse_reply(&reply) {
                Some(pair) => Ok(pair),
                None => {
                    warn!(log_id = log.id, "unusable title reply, using fallback");
                    Ok(fallback_title_description(log))
                }
            },
            Err(e) => {
                warn!(log_id = log.id, error = %e, "title generation call failed");
                Ok(fallback_title_description(log))
            }
        }
    }
}

/// Whether this incident warrants the expensive model: deep traces, many
/// logs, or an already-known root cause signal complexity worth paying for.
pub fn should_use_expensive_model(logs: &[LogEntry], root_cause: Option<&str>) -> bool {
    if root_cause.is_some_and(|rc| rc.len() > 200) {
        return true;
    }
    if logs.len() >= 10 {
        return true;
    }
    logs.iter().any(|log| {
        let frames = log.message.matches("\n    at ").count() + log.message.matches("File \"").count();
        frames >= 5
    })
}

/// Root-cause analysis over the incident's logs and traces.
///
/// When a cheap model is configured, simple incidents route to it and only
/// deep traces, large log sets, or long prior root causes pay for the
/// expensive model.
pub struct RootCauseAnalyzer {
    llm: Arc<dyn CompletionClient>,
    cheap_llm: Option<Arc<dyn CompletionClient>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RootCauseAnalysis {
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub suggested_action: String,
}

impl RootCauseAnalyzer {
    pub fn new(llm: Arc<dyn CompletionClient>) -> Self {
        Self {
            llm,
            cheap_llm: None,
        }
    }

    pub fn with_cheap_model(mut self, cheap_llm: Arc<dyn CompletionClient>) -> Self {
        self.cheap_llm = Some(cheap_llm);
        self
    }

    /// Produce a root cause, or `None` when the model cannot. Callers treat
    /// `None` as "skip the agent run and leave the incident for a human".
    pub async fn analyze(
        &self,
        incident: &Incident,
        logs: &[LogEntry],
    ) -> Option<RootCauseAnalysis> {
        let mut log_lines = String::new();
        for log in logs.iter().take(10) {
            let message: String = log.message.chars().take(500).collect();
            log_lines.push_str(&format!("[{}] {}\n", log.severity, message));
        }
        let traces = collect_stack_traces(incident, logs);
        let trace_block = traces
            .first()
            .map(|t| {
                let snippet: String = t.chars().take(2000).collect();
                format!("\nStack trace:\n```\n{snippet}\n```\n")
            })
            .unwrap_or_default();
        let prompt = format!(
            "You are a senior engineer diagnosing a production incident.\n\n\
             Incident: {}\nService: {}\nSeverity: {}\n\nRecent logs:\n{log_lines}{trace_block}\n\
             Identify the most likely root cause. Respond with ONLY a JSON object:\n\
             {{\"root_cause\": \"one-paragraph diagnosis\", \
             \"affected_files\": [\"paths mentioned in the trace\"], \
             \"suggested_action\": \"one sentence\"}}",
            incident.title, incident.service_name, incident.severity
        );
        let llm = match &self.cheap_llm {
            Some(cheap)
                if !should_use_expensive_model(logs, incident.root_cause.as_deref()) =>
            {
                cheap.as_ref()
            }
            _ => self.llm.as_ref(),
        };
        match llm.complete(&prompt).await {
            Ok(reply) => {
                let parsed = extract_json_object(&reply)
                    .and_then(|json| serde_json::from_str::<RootCauseAnalysis>(&json).ok());
                match parsed {
                    Some(analysis) if !analysis.root_cause.trim().is_empty() => {
                        info!(incident_id = incident.id, "root cause identified");
                        Some(analysis)
                    }
                    _ => {
                        warn!(incident_id = incident.id, "unusable root-cause reply");
                        None
                    }
                }
            }
            Err(e) => {
                warn!(incident_id = incident.id, error = %e, "root-cause analysis failed");
                None
            }
        }
    }
}

/// Repo languages detected from file extensions, most common first.
pub fn detect_languages(file_paths: &[String]) -> Vec<(String, usize)> {
    let mut counts: std::collections::HashMap<&'static str, usize> = std::collections::HashMap::new();
    for path in file_paths {
        let lang = match path.rsplit('.').next() {
            Some("ts") | Some("tsx") => "TypeScript",
            Some("js") | Some("jsx") => "JavaScript",
            Some("py") => "Python",
            Some("rs") => "Rust",
            Some("go") => "Go",
            Some("java") => "Java",
            Some("rb") => "Ruby",
            _ => continue,
        };
        *counts.entry(lang).or_insert(0) += 1;
    }
    let mut list: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    list.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pipeline::incident::LogSeverity;

    struct CannedLlm(String);

    #[async_trait]
    impl CompletionClient for CannedLlm {
        async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    fn log(message: &str) -> LogEntry {
        LogEntry {
            id: 1,
            timestamp: Utc::now(),
            service_name: "svc".into(),
            severity: LogSeverity::Error,
            message: message.into(),
            source: "app".into(),
            user_id: 7,
            integration_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn json_title_reply_is_used() {
        let generator = LlmTitleGenerator::new(Arc::new(CannedLlm(
            r#"{"title": "Payment worker crashes on null customer", "description": "The worker dereferences a missing customer record."}"#.into(),
        )));
        let (title, description) = generator.generate(&log("boom"), "svc").await.unwrap();
        assert_eq!(title, "Payment worker crashes on null customer");
        assert!(description.contains("customer record"));
    }

    #[tokio::test]
    async fn fenced_and_plaintext_replies_parse() {
        let fenced = LlmTitleGenerator::new(Arc::new(CannedLlm(
            "```json\n{\"title\": \"DB timeout\", \"description\": \"Queries exceed 30s.\"}\n```".into(),
        )));
        let (title, _) = fenced.generate(&log("boom"), "svc").await.unwrap();
        assert_eq!(title, "DB timeout");

        let plain = LlmTitleGenerator::new(Arc::new(CannedLlm(
            "Title: Cache stampede on login\nDescription: Burst of cold lookups after deploy.".into(),
        )));
        let (title, description) = plain.generate(&log("boom"), "svc").await.unwrap();
        assert_eq!(title, "Cache stampede on login");
        assert!(description.contains("cold lookups"));
    }

    #[tokio::test]
    async fn garbage_reply_falls_back() {
        let generator =
            LlmTitleGenerator::new(Arc::new(CannedLlm("I don't know what happened".into())));
        let (title, _) = generator.generate(&log("NullPointerException"), "svc").await.unwrap();
        assert_eq!(title, "Detected ERROR in svc");
    }

    #[test]
    fn model_routing_heuristics() {
        assert!(!should_use_expensive_model(&[log("simple error")], None));
        let long_cause = "r".repeat(300);
        assert!(should_use_expensive_model(&[log("x")], Some(long_cause.as_str())));
        let deep = log(&format!("Error: y{}", "\n    at f (/app/src/a.ts:1:1)".repeat(6)));
        assert!(should_use_expensive_model(&[deep], None));
        let many: Vec<LogEntry> = (0..10).map(|_| log("e")).collect();
        assert!(should_use_expensive_model(&many, None));
    }

    #[tokio::test]
    async fn root_cause_none_on_empty_reply() {
        let analyzer = RootCauseAnalyzer::new(Arc::new(CannedLlm(
            r#"{"root_cause": "", "affected_files": []}"#.into(),
        )));
        let incident = {
            let now = Utc::now();
            Incident {
                id: 1,
                title: "t".into(),
                description: String::new(),
                severity: pipeline::incident::IncidentSeverity::High,
                status: pipeline::incident::IncidentStatus::Open,
                service_name: "svc".into(),
                source: "app".into(),
                user_id: 7,
                integration_id: None,
                repo_name: None,
                log_ids: vec![],
                trigger_event: None,
                metadata: serde_json::Value::Null,
                first_seen_at: now,
                last_seen_at: now,
                created_at: now,
                resolved_at: None,
                root_cause: None,
                action_taken: None,
                code_fix_explanation: None,
                pr_info: None,
            }
        };
        assert!(analyzer.analyze(&incident, &[]).await.is_none());
    }

    #[test]
    fn language_detection_orders_by_count() {
        let files = vec![
            "src/a.ts".to_string(),
            "src/b.ts".to_string(),
            "src/c.tsx".to_string(),
            "scripts/x.py".to_string(),
        ];
        let langs = detect_languages(&files);
        assert_eq!(langs[0].0, "TypeScript");
        assert_eq!(langs[0].1, 3);
        assert_eq!(langs[1].0, "Python");
    }
}
