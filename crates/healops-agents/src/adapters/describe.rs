//! Enhanced incident description: the standard Markdown rendering used
//! for tickets.
//!
//! Sections: Incident Details, Description, Root Cause, Trace Information,
//! Spans (capped at 20 rows), Execution Flow (ASCII tree from span
//! parent/child relations, cycle-safe, depth-capped at 20), Stack Traces
//! (non-dependency only, capped), Related Logs Summary, Metadata, Action
//! Taken, Repository.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use pipeline::incident::{Incident, LogEntry};
use pipeline::reducer::IncidentDescriber;
use serde_json::Value;

use crate::classifier::trace_strings_from_log;

/// Max rows in the spans table.
const MAX_SPAN_ROWS: usize = 20;
/// Max depth of the execution-flow tree.
const MAX_FLOW_DEPTH: usize = 20;
/// Max stack traces included.
const MAX_STACK_TRACES: usize = 5;
/// Max characters per included stack trace.
const MAX_TRACE_CHARS: usize = 1000;

#[derive(Debug, Clone)]
struct SpanNode {
    span_id: String,
    parent_span_id: Option<String>,
    span_name: String,
    duration_ms: f64,
    status_code: i64,
    message: String,
    children: Vec<String>,
}

#[derive(Debug, Default)]
pub struct TraceFlow {
    pub trace_id: Option<String>,
    pub flow: String,
    pub total_spans: usize,
    pub error_spans: usize,
    spans: BTreeMap<String, SpanNode>,
    roots: Vec<String>,
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Build the span tree from log metadata (`spanId`, `parentSpanId`,
/// `spanName`, `duration`, `statusCode`, `traceId`).
pub fn build_trace_execution_flow(logs: &[LogEntry]) -> TraceFlow {
    let mut flow = TraceFlow::default();

    for log in logs {
        let Some(metadata) = log.metadata.as_object() else {
            continue;
        };
        let Some(span_id) = non_empty_str(metadata.get("spanId")) else {
            continue;
        };
        let parent_span_id = non_empty_str(metadata.get("parentSpanId"));
        let node = SpanNode {
            span_id: span_id.clone(),
            parent_span_id,
            span_name: non_empty_str(metadata.get("spanName")).unwrap_or_else(|| "unknown".into()),
            duration_ms: metadata.get("duration").and_then(Value::as_f64).unwrap_or(0.0),
            status_code: metadata.get("statusCode").and_then(Value::as_i64).unwrap_or(0),
            message: log.message.chars().take(100).collect(),
            children: Vec::new(),
        };
        if flow.trace_id.is_none() {
            flow.trace_id = non_empty_str(metadata.get("traceId"));
        }
        flow.spans.insert(span_id, node);
    }

    // Parent/child edges; self-parents and unknown parents become roots.
    let span_ids: Vec<String> = flow.spans.keys().cloned().collect();
    for span_id in &span_ids {
        let parent = flow
            .spans
            .get(span_id)
            .and_then(|n| n.parent_span_id.clone());
        match parent {
            Some(parent_id) if parent_id != *span_id && flow.spans.contains_key(&parent_id) => {
                if let Some(parent_node) = flow.spans.get_mut(&parent_id) {
                    parent_node.children.push(span_id.clone());
                }
            }
            _ => flow.roots.push(span_id.clone()),
        }
    }

    // Render the tree.
    let mut lines = Vec::new();
    if let Some(trace_id) = &flow.trace_id {
        lines.push(format!("Trace ID: {trace_id}"));
        lines.push(String::new());
    }
    let roots = flow.roots.clone();
    let mut visited = HashSet::new();
    for root in &roots {
        render_span(&flow.spans, root, 0, &mut visited, &mut lines);
    }

    flow.total_spans = flow.spans.len();
    flow.error_spans = flow.spans.values().filter(|s| s.status_code == 2).count();
    flow.flow = lines.join("\n");
    flow
}

fn render_span(
    spans: &BTreeMap<String, SpanNode>,
    span_id: &str,
    depth: usize,
    visited: &mut HashSet<String>,
    lines: &mut Vec<String>,
) {
    let indent = "  ".repeat(depth);
    let Some(node) = spans.get(span_id) else {
        return;
    };
    if visited.contains(span_id) {
        lines.push(format!("{indent}+- [CYCLE DETECTED: {}]", node.span_name));
        return;
    }
    visited.insert(span_id.to_string());

    let status = if node.status_code == 2 { "ERROR" } else { "OK" };
    let mut line = format!("{indent}+- {} ({}ms) [{status}]", node.span_name, node.duration_ms);
    if !node.message.is_empty() {
        line.push_str(&format!(": {}", node.message));
    }
    lines.push(line);

    if depth < MAX_FLOW_DEPTH {
        for child in &node.children {
            render_span(spans, child, depth + 1, visited, lines);
        }
    } else {
        lines.push(format!("{}+- [MAX DEPTH REACHED]", "  ".repeat(depth + 1)));
    }
    visited.remove(span_id);
}

/// Render the full enhanced description.
pub fn build_enhanced_description(incident: &Incident, logs: &[LogEntry]) -> String {
    let mut parts: Vec<String> = Vec::new();

    parts.push("## Incident Details".to_string());
    parts.push(format!("**Service:** {}", or_na(&incident.service_name)));
    parts.push(format!("**Severity:** {}", incident.severity));
    parts.push(format!("**Source:** {}", or_na(&incident.source)));
    parts.push(format!("**Status:** {}", incident.status));
    parts.push(format!(
        "**First Seen:** {}",
        incident.first_seen_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    parts.push(format!(
        "**Last Seen:** {}",
        incident.last_seen_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    parts.push(String::new());

    if !incident.description.is_empty() {
        parts.push("## Description".to_string());
        parts.push(incident.description.clone());
        parts.push(String::new());
    }

    if let Some(root_cause) = &incident.root_cause {
        parts.push("## Root Cause".to_string());
        parts.push(root_cause.clone());
        parts.push(String::new());
    }

    let flow = build_trace_execution_flow(logs);
    if flow.total_spans > 0 {
        parts.push("## Trace Information".to_string());
        if let Some(trace_id) = &flow.trace_id {
            parts.push(format!("**Trace ID:** `{trace_id}`"));
        }
        parts.push(format!(
            "**Spans:** {} total, {} with errors",
            flow.total_spans, flow.error_spans
        ));
        parts.push(String::new());

        parts.push("## Spans".to_string());
        parts.push("| Span | Duration (ms) | Status |".to_string());
        parts.push("|---|---|---|".to_string());
        for node in flow.spans.values().take(MAX_SPAN_ROWS) {
            let status = if node.status_code == 2 { "ERROR" } else { "OK" };
            parts.push(format!(
                "| {} | {} | {status} |",
                node.span_name, node.duration_ms
            ));
        }
        if flow.total_spans > MAX_SPAN_ROWS {
            parts.push(format!(
                "| ... and {} more spans | | |",
                flow.total_spans - MAX_SPAN_ROWS
            ));
        }
        parts.push(String::new());

        if !flow.flow.is_empty() {
            parts.push("## Execution Flow".to_string());
            parts.push("```".to_string());
            parts.push(flow.flow.clone());
            parts.push("```".to_string());
            parts.push(String::new());
        }
    }

    let mut traces: Vec<String> = Vec::new();
    for log in logs {
        for trace in trace_strings_from_log(log) {
            if trace.contains("node_modules") {
                continue;
            }
            traces.push(trace);
            if traces.len() >= MAX_STACK_TRACES {
                break;
            }
        }
        if traces.len() >= MAX_STACK_TRACES {
            break;
        }
    }
    if !traces.is_empty() {
        parts.push("## Stack Traces".to_string());
        for (i, trace) in traces.iter().enumerate() {
            let snippet: String = trace.chars().take(MAX_TRACE_CHARS).collect();
            parts.push(format!("### Trace {}", i + 1));
            parts.push("```".to_string());
            parts.push(snippet);
            parts.push("```".to_string());
        }
        parts.push(String::new());
    }

    if !logs.is_empty() {
        parts.push("## Related Logs Summary".to_string());
        parts.push(format!("{} log entries attached to this incident.", logs.len()));
        for log in logs.iter().take(5) {
            let message: String = log.message.chars().take(150).collect();
            parts.push(format!("- [{}] {}", log.severity, message));
        }
        parts.push(String::new());
    }

    if let Some(metadata) = incident.metadata.as_object() {
        let interesting: Vec<(&String, &Value)> = metadata
            .iter()
            .filter(|(k, _)| {
                !matches!(k.as_str(), "events" | "linear_issue") && !k.starts_with('_')
            })
            .take(10)
            .collect();
        if !interesting.is_empty() {
            parts.push("## Metadata".to_string());
            for (key, value) in interesting {
                let rendered = match value {
                    Value::String(s) => s.chars().take(120).collect::<String>(),
                    other => {
                        let s = other.to_string();
                        s.chars().take(120).collect()
                    }
                };
                parts.push(format!("- **{key}:** {rendered}"));
            }
            parts.push(String::new());
        }
    }

    if let Some(action) = &incident.action_taken {
        parts.push("## Action Taken".to_string());
        parts.push(action.clone());
        parts.push(String::new());
    }

    if let Some(repo) = &incident.repo_name {
        parts.push("## Repository".to_string());
        parts.push(format!("`{repo}`"));
    }

    parts.join("\n")
}

fn or_na(s: &str) -> &str {
    if s.is_empty() {
        "N/A"
    } else {
        s
    }
}

/// Trait bridge so the reducer can render ticket descriptions without
/// depending on this crate.
pub struct EnhancedDescriber;

#[async_trait]
impl IncidentDescriber for EnhancedDescriber {
    async fn describe(&self, incident: &Incident, logs: &[LogEntry]) -> String {
        build_enhanced_description(incident, logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pipeline::incident::{IncidentSeverity, IncidentStatus, LogSeverity};
    use serde_json::json;

    fn span_log(id: i64, span_id: &str, parent: Option<&str>, name: &str, status: i64) -> LogEntry {
        let mut metadata = json!({
            "traceId": "trace-1",
            "spanId": span_id,
            "spanName": name,
            "duration": 12.5,
            "statusCode": status,
        });
        if let Some(parent) = parent {
            metadata["parentSpanId"] = json!(parent);
        }
        LogEntry {
            id,
            timestamp: Utc::now(),
            service_name: "svc".into(),
            severity: LogSeverity::Error,
            message: format!("span {name}"),
            source: "app".into(),
            user_id: 7,
            integration_id: None,
            metadata,
        }
    }

    fn incident() -> Incident {
        let now = Utc::now();
        Incident {
            id: 1,
            title: "t".into(),
            description: "Something broke".into(),
            severity: IncidentSeverity::High,
            status: IncidentStatus::Open,
            service_name: "svc".into(),
            source: "app".into(),
            user_id: 7,
            integration_id: None,
            repo_name: Some("acme/svc".into()),
            log_ids: vec![1, 2],
            trigger_event: None,
            metadata: json!({"region": "eu-west-1"}),
            first_seen_at: now,
            last_seen_at: now,
            created_at: now,
            resolved_at: None,
            root_cause: Some("Null customer in charge path".into()),
            action_taken: None,
            code_fix_explanation: None,
            pr_info: None,
        }
    }

    #[test]
    fn flow_builds_parent_child_tree() {
        let logs = vec![
            span_log(1, "a", None, "http.request", 0),
            span_log(2, "b", Some("a"), "db.query", 2),
            span_log(3, "c", Some("b"), "row.decode", 2),
        ];
        let flow = build_trace_execution_flow(&logs);
        assert_eq!(flow.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(flow.total_spans, 3);
        assert_eq!(flow.error_spans, 2);
        let http_idx = flow.flow.find("http.request").unwrap();
        let db_idx = flow.flow.find("  +- db.query").unwrap();
        let decode_idx = flow.flow.find("    +- row.decode").unwrap();
        assert!(http_idx < db_idx && db_idx < decode_idx);
    }

    #[test]
    fn cyclic_spans_do_not_recurse_forever() {
        // a → b → a
        let logs = vec![
            span_log(1, "a", Some("b"), "first", 0),
            span_log(2, "b", Some("a"), "second", 0),
        ];
        let flow = build_trace_execution_flow(&logs);
        assert!(flow.flow.contains("CYCLE DETECTED"));
        assert_eq!(flow.total_spans, 2);
    }

    #[test]
    fn orphan_parents_become_roots() {
        let logs = vec![span_log(1, "x", Some("missing"), "orphan", 0)];
        let flow = build_trace_execution_flow(&logs);
        assert!(flow.flow.contains("orphan"));
    }

    #[test]
    fn description_has_all_sections() {
        let logs = vec![
            span_log(1, "a", None, "http.request", 2),
            span_log(2, "b", Some("a"), "db.query", 0),
        ];
        let doc = build_enhanced_description(&incident(), &logs);
        assert!(doc.contains("## Incident Details"));
        assert!(doc.contains("**Service:** svc"));
        assert!(doc.contains("## Description"));
        assert!(doc.contains("## Root Cause"));
        assert!(doc.contains("## Trace Information"));
        assert!(doc.contains("## Spans"));
        assert!(doc.contains("## Execution Flow"));
        assert!(doc.contains("## Related Logs Summary"));
        assert!(doc.contains("**region:** eu-west-1"));
        assert!(doc.contains("## Repository"));
        assert!(doc.contains("`acme/svc`"));
    }

    #[test]
    fn span_table_is_capped() {
        let logs: Vec<LogEntry> = (0..30)
            .map(|i| span_log(i, &format!("s{i}"), None, &format!("span{i}"), 0))
            .collect();
        let doc = build_enhanced_description(&incident(), &logs);
        assert!(doc.contains("... and 10 more spans"));
    }

    #[test]
    fn node_modules_traces_are_excluded() {
        let mut log = span_log(1, "a", None, "x", 0);
        log.message = format!(
            "Error: boom\n    at z (/app/node_modules/lib/i.js:1:1){}",
            " pad".repeat(20)
        );
        let doc = build_enhanced_description(&incident(), &[log]);
        assert!(!doc.contains("## Stack Traces"));
    }
}
