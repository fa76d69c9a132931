//! Lenient extraction of plan JSON from LLM replies.
//!
//! Accepts, in order of preference: a fenced ```json block containing an
//! array, the first bracketed array anywhere in the text, or the raw text.
//! Before parsing, invalid escape sequences (a `\` not followed by a
//! recognized JSON escape) are doubled; models routinely emit `\d` and
//! friends inside regex-bearing strings.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::errors::{PipelineError, PipelineResult};

/// Raw plan step as the model emits it.
#[derive(Debug, Deserialize)]
pub struct RawPlanStep {
    pub step_number: Option<u32>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files_to_read: Vec<String>,
    #[serde(default)]
    pub expected_output: String,
}

fn fenced_array_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\[.*?\])\s*```")
            .unwrap_or_else(|e| unreachable!("static fence regex must compile: {e}"))
    })
}

fn bare_array_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\[.*\]")
            .unwrap_or_else(|e| unreachable!("static array regex must compile: {e}"))
    })
}

/// Pull the JSON array text out of a model reply.
pub fn extract_json_array(text: &str) -> String {
    if let Some(caps) = fenced_array_re().captures(text) {
        if let Some(m) = caps.get(1) {
            return m.as_str().to_string();
        }
    }
    if let Some(m) = bare_array_re().find(text) {
        return m.as_str().to_string();
    }
    text.trim().to_string()
}

/// Double any backslash not starting a valid JSON escape
/// (`\" \\ \/ \b \f \n \r \t \uXXXX`).
pub fn repair_invalid_escapes(json: &str) -> String {
    let mut out = String::with_capacity(json.len() + 8);
    let mut chars = json.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let valid = match chars.peek() {
            Some('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't') => true,
            Some('u') => {
                let lookahead: Vec<char> = chars.clone().skip(1).take(4).collect();
                lookahead.len() == 4 && lookahead.iter().all(|h| h.is_ascii_hexdigit())
            }
            _ => false,
        };
        if valid {
            out.push('\\');
        } else {
            out.push_str("\\\\");
        }
    }
    out
}

/// Extract and parse a plan array, repairing invalid escapes if the first
/// parse attempt fails.
pub fn parse_plan_steps(text: &str) -> PipelineResult<Vec<RawPlanStep>> {
    let array_text = extract_json_array(text);
    match serde_json::from_str::<Vec<RawPlanStep>>(&array_text) {
        Ok(steps) => Ok(steps),
        Err(first_err) => {
            let repaired = repair_invalid_escapes(&array_text);
            serde_json::from_str::<Vec<RawPlanStep>>(&repaired).map_err(|_| {
                PipelineError::Plan(format!(
                    "failed to parse plan JSON: {first_err} (reply preview: {})",
                    &text.chars().take(200).collect::<String>()
                ))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_raw_array() {
        let reply = r#"[{"step_number": 1, "description": "read files", "files_to_read": ["a.ts"], "expected_output": "context"}]"#;
        let steps = parse_plan_steps(reply).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].files_to_read, vec!["a.ts"]);
    }

    #[test]
    fn parses_fenced_array_with_prose() {
        let reply = "Here is the plan:\n```json\n[{\"step_number\": 1, \"description\": \"read\"}]\n```\nGood luck!";
        let steps = parse_plan_steps(reply).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].description, "read");
    }

    #[test]
    fn repairs_invalid_regex_escapes() {
        let reply = r#"```json
[{"step_number": 1, "description": "match \d+ occurrences in the log line"}]
```"#;
        let steps = parse_plan_steps(reply).unwrap();
        assert_eq!(steps[0].description, r"match \d+ occurrences in the log line");
    }

    #[test]
    fn keeps_valid_escapes_intact() {
        let json = r#"[{"step_number":1,"description":"line1\nline2 \"quoted\" é"}]"#;
        let repaired = repair_invalid_escapes(json);
        assert_eq!(repaired, json);
    }

    #[test]
    fn repair_handles_trailing_backslash() {
        let repaired = repair_invalid_escapes(r#"["path\"#);
        assert_eq!(repaired, r#"["path\\"#);
    }

    #[test]
    fn total_garbage_is_an_error() {
        let err = parse_plan_steps("I cannot produce a plan right now.").unwrap_err();
        assert!(err.to_string().contains("failed to parse plan JSON"));
    }
}
