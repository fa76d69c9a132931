//! External-code guard: skip resolution when the error lives in
//! dependency code.
//!
//! Stack traces are collected from the incident's logs (messages plus
//! `exception.stacktrace` metadata events); the first substantial trace is
//! classified by a small model. When classification is unavailable or
//! ambiguous, the safe default is "application code" so real incidents are
//! never silently skipped.

use pipeline::incident::{Incident, LogEntry};
use pipeline::planner::CompletionClient;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::llm::extract_json_object;

/// Markers that make a message look like a stack trace.
const STACK_TRACE_KEYWORDS: [&str; 6] = [
    "Traceback",
    "at ",
    "File \"",
    "Error:",
    "Exception:",
    "node_modules",
];

/// Minimum length for a snippet to count as a trace.
const MIN_TRACE_LEN: usize = 50;

/// Pull stack-trace strings out of one log: the message when it looks like
/// a trace, plus any `exception.stacktrace` attributes in metadata events.
pub fn trace_strings_from_log(log: &LogEntry) -> Vec<String> {
    let mut traces = Vec::new();
    let msg = log.message.trim();
    if msg.len() >= MIN_TRACE_LEN && STACK_TRACE_KEYWORDS.iter().any(|k| msg.contains(k)) {
        traces.push(msg.to_string());
    }
    if let Some(events) = log.metadata.get("events").and_then(Value::as_array) {
        for event in events {
            let trace = event
                .get("attributes")
                .and_then(|a| a.get("exception.stacktrace"))
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("");
            if trace.len() >= MIN_TRACE_LEN {
                traces.push(trace.to_string());
            }
        }
    }
    traces
}

/// All stack traces for an incident: its logs first, then any trace-shaped
/// strings in incident metadata events.
pub fn collect_stack_traces(incident: &Incident, logs: &[LogEntry]) -> Vec<String> {
    let mut traces = Vec::new();
    for log in logs {
        traces.extend(trace_strings_from_log(log));
    }
    if let Some(events) = incident.metadata.get("events").and_then(Value::as_array) {
        for event in events {
            let trace = event
                .get("attributes")
                .and_then(|a| a.get("exception.stacktrace"))
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("");
            if trace.len() >= MIN_TRACE_LEN {
                traces.push(trace.to_string());
            }
        }
    }
    traces
}

#[derive(Deserialize)]
struct ClassificationReply {
    #[serde(default)]
    is_node_modules: bool,
}

/// Classifier over a small model. The prompt asks for a strict JSON verdict;
/// anything else defaults to "application code".
pub struct ExternalCodeClassifier<'a> {
    llm: &'a dyn CompletionClient,
}

impl<'a> ExternalCodeClassifier<'a> {
    pub fn new(llm: &'a dyn CompletionClient) -> Self {
        Self { llm }
    }

    /// Whether a stack trace originates primarily in third-party code.
    pub async fn is_trace_from_dependencies(&self, stack_trace: &str) -> bool {
        if stack_trace.trim().len() < MIN_TRACE_LEN {
            return false;
        }
        let truncated: String = stack_trace.chars().take(2000).collect();
        let prompt = format!(
            "Analyze the following stack trace and determine if it originates primarily \
             from third-party dependencies (node_modules, vendor libraries) or from \
             application code.\n\nStack Trace:\n{truncated}\n\n\
             Respond with ONLY a JSON object: {{\"is_node_modules\": true or false}}\n\n\
             Rules:\n\
             - Paths containing node_modules or vendor libraries indicate dependency code.\n\
             - Paths under src/, app/, pages/, components/ indicate application code.\n\
             - Mixed traces: judge by where the majority of frames point."
        );
        match self.llm.complete(&prompt).await {
            Ok(reply) => {
                let parsed = extract_json_object(&reply)
                    .and_then(|json| serde_json::from_str::<ClassificationReply>(&json).ok());
                match parsed {
                    Some(c) => c.is_node_modules,
                    None => {
                        warn!("unparseable classifier reply, assuming application code");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "trace classification failed, assuming application code");
                false
            }
        }
    }

    /// The guard proper: `(true, sample_trace)` when the incident's first
    /// substantial trace is judged third-party.
    pub async fn is_incident_from_external_code(
        &self,
        incident: &Incident,
        logs: &[LogEntry],
    ) -> (bool, String) {
        let traces = collect_stack_traces(incident, logs);
        let Some(sample) = traces.into_iter().next() else {
            return (false, String::new());
        };
        if self.is_trace_from_dependencies(&sample).await {
            let mut display: String = sample.chars().take(1500).collect();
            if display.len() < sample.len() {
                display.push_str("...");
            }
            (true, display)
        } else {
            (false, String::new())
        }
    }
}

/// Heading every skip explanation must open with.
const SKIP_HEADING: &str = "## Why we didn't auto-resolve this incident";
/// Replies shorter than this are treated as a failed generation.
const MIN_AI_DESCRIPTION_LEN: usize = 100;

/// Ask the small model for an explanation tailored to the incident and
/// trace (naming the package or error type when visible). Returns `None`
/// when the reply is unusable; callers fall back to the static template.
async fn generate_skipped_description_with_ai(
    llm: &dyn CompletionClient,
    incident: &Incident,
    sample_trace: &str,
) -> Option<String> {
    let title = if incident.title.is_empty() {
        "Incident"
    } else {
        &incident.title
    };
    let service = if incident.service_name.is_empty() {
        "Service"
    } else {
        &incident.service_name
    };
    let truncated: String = sample_trace.chars().take(1500).collect();
    let prompt = format!(
        "You are writing a short, developer-friendly explanation for a dashboard. We did \
         NOT auto-fix this incident because the error comes from dependency code (e.g. \
         node_modules or vendor libs), which we do not modify.\n\n\
         Context:\n- Incident: {title}\n- Service: {service}\n\n\
         Stack trace snippet (use it to make the explanation specific, naming the package \
         or error type when visible):\n```\n{truncated}\n```\n\n\
         Write a single markdown document with:\n\
         1. A heading: {SKIP_HEADING}\n\
         2. **Incident:** and **Service:** lines under the heading.\n\
         3. One short paragraph explaining that the error originates from dependency or \
         external code and we only fix application code. Be specific if the trace shows a \
         package name or error type.\n\
         4. A subsection \"### Flow (what happened)\" with a simple ASCII diagram \
         (your app -> dependency -> error; our agent skips) and one line of next steps.\n\
         5. A subsection \"### What you can do\" with 3-4 concise bullets: upgrade or pin \
         the dependency, handle the error in app code, report upstream.\n\n\
         Do not repeat the full stack trace. Output only the markdown."
    );
    let reply = match llm.complete(&prompt).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(incident_id = incident.id, error = %e, "skip-description generation failed");
            return None;
        }
    };
    // Strip a wrapping markdown code fence, if present.
    let mut content = reply.trim().to_string();
    if content.starts_with("```") {
        content = content
            .trim_start_matches("```markdown")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
    }
    if content.len() < MIN_AI_DESCRIPTION_LEN || !content.starts_with(SKIP_HEADING) {
        warn!(incident_id = incident.id, "unusable skip-description reply, using template");
        return None;
    }
    Some(content)
}

/// Build the skip explanation, preferring model-tailored copy. The raw
/// trace snippet is appended so developers always have it; the static
/// template covers every failure mode.
pub async fn build_skipped_resolution_description_with(
    llm: &dyn CompletionClient,
    incident: &Incident,
    sample_trace: &str,
) -> String {
    if !sample_trace.is_empty() {
        if let Some(description) =
            generate_skipped_description_with_ai(llm, incident, sample_trace).await
        {
            return format!(
                "{}\n\n### Stack trace (relevant snippet)\n\n```\n{}\n```",
                description.trim_end(),
                sample_trace.trim()
            );
        }
    }
    build_skipped_resolution_description(incident, sample_trace)
}

/// Static "why we didn't auto-resolve" template, used when the model
/// cannot produce a usable description.
pub fn build_skipped_resolution_description(incident: &Incident, sample_trace: &str) -> String {
    let title = if incident.title.is_empty() {
        "Incident"
    } else {
        &incident.title
    };
    let service = if incident.service_name.is_empty() {
        "Service"
    } else {
        &incident.service_name
    };
    let trace_section = if sample_trace.is_empty() {
        String::new()
    } else {
        format!(
            "\n### Stack trace (relevant snippet)\n\n```\n{}\n```\n",
            sample_trace.trim()
        )
    };
    format!(
        "## Why we didn't auto-resolve this incident\n\n\
         **Incident:** {title}  \n\
         **Service:** {service}\n\n\
         The error **originates from external or dependency code** (e.g. `node_modules`, \
         third-party or vendor libs). Our coding agent only modifies your application code, \
         not dependencies, so we did not attempt an automated fix.\n\n\
         ### Flow (what happened)\n\n\
         ```\n\
         [Your app] -> calls -> [Dependency in node_modules/vendor]\n\
                                  |\n\
                                  v\n\
         Error thrown here (stack trace points to dependency)\n\
                                  |\n\
                                  v\n\
         [Our agent] -> skips -> No change to your repo\n\
         ```\n\n\
         **Next steps:** Upgrade or patch the dependency, report upstream, or fix the call \
         site in your app.\n\
         {trace_section}\n\
         ### What you can do\n\n\
         - **Upgrade the dependency** if a newer version fixes the issue.\n\
         - **Pin a known-good version** if a recent upgrade introduced the bug.\n\
         - **Handle the error in your code** (try/catch) and log or report it.\n\
         - **Report upstream** to the package maintainers if it's a bug in the dependency.\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use pipeline::incident::{IncidentSeverity, IncidentStatus, LogSeverity};
    use serde_json::json;

    struct CannedLlm(String);

    #[async_trait]
    impl CompletionClient for CannedLlm {
        async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn incident() -> Incident {
        let now = Utc::now();
        Incident {
            id: 1,
            title: "Crash in payment worker".into(),
            description: String::new(),
            severity: IncidentSeverity::High,
            status: IncidentStatus::Open,
            service_name: "payments".into(),
            source: "app".into(),
            user_id: 7,
            integration_id: None,
            repo_name: None,
            log_ids: vec![1],
            trigger_event: None,
            metadata: json!({}),
            first_seen_at: now,
            last_seen_at: now,
            created_at: now,
            resolved_at: None,
            root_cause: None,
            action_taken: None,
            code_fix_explanation: None,
            pr_info: None,
        }
    }

    fn node_modules_log() -> LogEntry {
        LogEntry {
            id: 1,
            timestamp: Utc::now(),
            service_name: "payments".into(),
            severity: LogSeverity::Error,
            message: "TypeError: cannot read x\n    at z (/app/node_modules/stripe/lib/api.js:10:5)\n    at q (/app/node_modules/stripe/lib/client.js:22:1)".into(),
            source: "app".into(),
            user_id: 7,
            integration_id: None,
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn guard_fires_on_dependency_trace() {
        // Scenario S3: every frame under node_modules, classifier says yes.
        let llm = CannedLlm(r#"{"is_node_modules": true}"#.into());
        let classifier = ExternalCodeClassifier::new(&llm);
        let (external, sample) = classifier
            .is_incident_from_external_code(&incident(), &[node_modules_log()])
            .await;
        assert!(external);
        assert!(sample.contains("node_modules/stripe"));
    }

    #[tokio::test]
    async fn guard_defaults_to_application_code_on_bad_reply() {
        let llm = CannedLlm("I think it might be dependencies, hard to say!".into());
        let classifier = ExternalCodeClassifier::new(&llm);
        let (external, _) = classifier
            .is_incident_from_external_code(&incident(), &[node_modules_log()])
            .await;
        assert!(!external);
    }

    #[tokio::test]
    async fn no_traces_means_no_guard() {
        let llm = CannedLlm(r#"{"is_node_modules": true}"#.into());
        let classifier = ExternalCodeClassifier::new(&llm);
        let mut log = node_modules_log();
        log.message = "short".into();
        let (external, sample) = classifier
            .is_incident_from_external_code(&incident(), &[log])
            .await;
        assert!(!external);
        assert!(sample.is_empty());
    }

    #[tokio::test]
    async fn metadata_stacktrace_events_are_collected() {
        let mut log = node_modules_log();
        log.message = "short".into();
        log.metadata = json!({
            "events": [{
                "attributes": {
                    "exception.stacktrace": "Error: boom\n    at deep (/app/node_modules/lib/x.js:1:1)\n    at deeper (/app/node_modules/lib/y.js:2:2)"
                }
            }]
        });
        let traces = collect_stack_traces(&incident(), &[log]);
        assert_eq!(traces.len(), 1);
        assert!(traces[0].starts_with("Error: boom"));
    }

    #[test]
    fn skipped_description_has_required_shape() {
        let doc = build_skipped_resolution_description(&incident(), "at x (node_modules/y.js:1:1) somewhere deep");
        assert!(doc.starts_with("## Why we didn't auto-resolve this incident"));
        assert!(doc.contains("**Incident:** Crash in payment worker"));
        assert!(doc.contains("**Service:** payments"));
        assert!(doc.contains("### What you can do"));
        assert!(doc.contains("### Stack trace (relevant snippet)"));
    }

    const TAILORED_REPLY: &str = "## Why we didn't auto-resolve this incident\n\n\
        **Incident:** Crash in payment worker  \n**Service:** payments\n\n\
        The `stripe` client library threw a TypeError inside its own request \
        pipeline; the failing frames live under node_modules, not in your code.\n\n\
        ### Flow (what happened)\n\n```\napp -> stripe -> TypeError; agent skips\n```\n\
        Next steps: pin or upgrade stripe.\n\n\
        ### What you can do\n\n- Upgrade stripe\n- Pin a known-good version\n- Report upstream\n";

    #[tokio::test]
    async fn tailored_description_is_preferred_and_trace_appended() {
        let llm = CannedLlm(TAILORED_REPLY.into());
        let trace = "TypeError at /app/node_modules/stripe/lib/api.js:10:5 somewhere deep enough";
        let doc = build_skipped_resolution_description_with(&llm, &incident(), trace).await;
        assert!(doc.starts_with("## Why we didn't auto-resolve this incident"));
        assert!(doc.contains("its own request"));
        assert!(doc.contains("### Stack trace (relevant snippet)"));
        assert!(doc.contains("node_modules/stripe/lib/api.js"));
    }

    #[tokio::test]
    async fn fenced_tailored_reply_is_unwrapped() {
        // Models sometimes wrap the whole document in a code fence.
        let fenced = format!("```markdown\n{TAILORED_REPLY}\n```");
        let llm = CannedLlm(fenced);
        let doc = build_skipped_resolution_description_with(
            &llm,
            &incident(),
            "at x (node_modules/y.js:1:1) somewhere deep",
        )
        .await;
        assert!(doc.starts_with("## Why we didn't auto-resolve this incident"));
        assert!(!doc.starts_with("```"));
        assert!(doc.contains("Pin a known-good version"));
    }

    #[tokio::test]
    async fn short_or_shapeless_replies_fall_back_to_template() {
        let trace = "at x (node_modules/y.js:1:1) somewhere deep";

        let short = CannedLlm("can't help".into());
        let doc = build_skipped_resolution_description_with(&short, &incident(), trace).await;
        assert!(doc.contains("**Upgrade the dependency**"));

        let wrong_heading = CannedLlm(
            "# Incident report\n\nThis dependency failure happened inside node_modules and we \
             decided not to touch it because we only modify application code, never vendored \
             packages or third-party libraries."
                .into(),
        );
        let doc = build_skipped_resolution_description_with(&wrong_heading, &incident(), trace).await;
        assert!(doc.starts_with("## Why we didn't auto-resolve this incident"));
        assert!(doc.contains("**Upgrade the dependency**"));
    }

    #[tokio::test]
    async fn empty_trace_uses_template_without_asking_the_model() {
        // With no trace to tailor to, the template is used directly.
        let llm = CannedLlm("irrelevant".into());
        let doc = build_skipped_resolution_description_with(&llm, &incident(), "").await;
        assert!(doc.starts_with("## Why we didn't auto-resolve this incident"));
        assert!(!doc.contains("### Stack trace (relevant snippet)"));
    }
}
