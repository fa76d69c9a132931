//! Incident fingerprinting: stable signatures over noisy log messages.
//!
//! Two incidents with the same service, source, severity and the same first
//! three (normalized) log messages get the same fingerprint, regardless of
//! timestamps, IP addresses, or UUIDs embedded in the text. The fingerprint
//! keys the memory store so past fixes for the same class of error are
//! found again.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::incident::{Incident, LogEntry};

/// Max characters of each normalized message included in the signature.
const MESSAGE_PREFIX_LEN: usize = 200;
/// Number of leading logs included in the signature.
const SIGNATURE_LOG_COUNT: usize = 3;

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}[\sT]\d{2}:\d{2}:\d{2}").unwrap_or_else(|e| {
            unreachable!("static timestamp regex must compile: {e}")
        })
    })
}

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b")
            .unwrap_or_else(|e| unreachable!("static ipv4 regex must compile: {e}"))
    })
}

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
        )
        .unwrap_or_else(|e| unreachable!("static uuid regex must compile: {e}"))
    })
}

/// Replace volatile tokens in a log message with stable placeholders.
pub fn normalize_message(message: &str) -> String {
    let msg = timestamp_re().replace_all(message, "[TIMESTAMP]");
    let msg = ipv4_re().replace_all(&msg, "[IP]");
    let msg = uuid_re().replace_all(&msg, "[UUID]");
    msg.into_owned()
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn sha256_prefix(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Derive the 16-hex fingerprint for an incident from its header and the
/// first three logs. Never fails: any irregularity degrades to a hash of
/// the incident id.
pub fn fingerprint(incident: &Incident, logs: &[LogEntry]) -> String {
    let mut parts: Vec<String> = vec![
        incident.service_name.clone(),
        incident.source.clone(),
        incident.severity.to_string(),
    ];
    for log in logs.iter().take(SIGNATURE_LOG_COUNT) {
        if log.message.is_empty() {
            continue;
        }
        let normalized = normalize_message(&log.message);
        parts.push(truncate_chars(&normalized, MESSAGE_PREFIX_LEN).to_string());
    }
    sha256_prefix(&parts.join("|"))
}

/// Fallback fingerprint used when the incident header itself is unavailable.
pub fn fingerprint_of_id(incident_id: i64) -> String {
    sha256_prefix(&incident_id.to_string())
}

/// Bucket a root cause into a coarse error type for learning-pattern
/// indexing. The fingerprint disambiguates within a bucket.
pub fn classify_error_type(fingerprint: &str, root_cause: &str) -> String {
    let lower = root_cause.to_ascii_lowercase();
    let bucket = if lower.contains("null") || lower.contains("undefined") || lower.contains("none")
    {
        "null_reference"
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("connection") || lower.contains("econnrefused") {
        "connection"
    } else if lower.contains("parse") || lower.contains("syntax") || lower.contains("unexpected token") {
        "parse"
    } else if lower.contains("permission") || lower.contains("forbidden") || lower.contains("unauthorized") {
        "permission"
    } else if lower.contains("memory") || lower.contains("oom") {
        "resource"
    } else {
        "other"
    };
    format!("{bucket}_{}", &fingerprint[..fingerprint.len().min(8)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::{IncidentSeverity, IncidentStatus, LogSeverity};
    use chrono::Utc;

    fn incident() -> Incident {
        let now = Utc::now();
        Incident {
            id: 42,
            title: String::new(),
            description: String::new(),
            severity: IncidentSeverity::High,
            status: IncidentStatus::Open,
            service_name: "svc-a".into(),
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
    }

    fn log(id: i64, message: &str) -> LogEntry {
        LogEntry {
            id,
            timestamp: Utc::now(),
            service_name: "svc-a".into(),
            severity: LogSeverity::Error,
            message: message.into(),
            source: "app".into(),
            user_id: 7,
            integration_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn normalization_replaces_volatile_tokens() {
        let msg = "2024-01-02T10:11:12 req 3f1b2e4a-0c1d-4e5f-8a9b-0c1d2e3f4a5b from 10.0.0.1 failed";
        let norm = normalize_message(msg);
        assert_eq!(norm, "[TIMESTAMP] req [UUID] from [IP] failed");
    }

    #[test]
    fn fingerprint_is_stable_across_volatile_token_values() {
        let inc = incident();
        let a = fingerprint(
            &inc,
            &[log(1, "error at 2024-01-02 10:11:12 from 10.0.0.1")],
        );
        let b = fingerprint(
            &inc,
            &[log(2, "error at 2031-12-30 23:59:59 from 192.168.4.77")],
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_differs_across_services() {
        let inc_a = incident();
        let mut inc_b = incident();
        inc_b.service_name = "svc-b".into();
        let logs = [log(1, "boom")];
        assert_ne!(fingerprint(&inc_a, &logs), fingerprint(&inc_b, &logs));
    }

    #[test]
    fn only_first_three_logs_participate() {
        let inc = incident();
        let base: Vec<LogEntry> = (0..3).map(|i| log(i, "same message")).collect();
        let mut extended = base.clone();
        extended.push(log(99, "a completely different trailing message"));
        assert_eq!(fingerprint(&inc, &base), fingerprint(&inc, &extended));
    }

    #[test]
    fn long_messages_truncate_at_200_chars() {
        let inc = incident();
        let long_a = format!("prefix {} suffix-a", "x".repeat(400));
        let long_b = format!("prefix {} suffix-b", "x".repeat(400));
        assert_eq!(
            fingerprint(&inc, &[log(1, &long_a)]),
            fingerprint(&inc, &[log(2, &long_b)])
        );
    }

    #[test]
    fn error_type_buckets() {
        let fp = "abcdef0123456789";
        assert!(classify_error_type(fp, "Cannot read property of null").starts_with("null_reference_"));
        assert!(classify_error_type(fp, "request timed out").starts_with("timeout_"));
        assert!(classify_error_type(fp, "ECONNREFUSED to db").starts_with("connection_"));
        assert!(classify_error_type(fp, "totally novel").starts_with("other_"));
    }
}
