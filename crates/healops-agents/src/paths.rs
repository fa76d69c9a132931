//! File-path extraction and normalization.
//!
//! Stack traces and log metadata carry container paths, webpack URLs, and
//! absolute build paths; the repo adapter and tool executor need
//! repo-relative paths. Bundled/minified artifacts and dependency trees
//! are filtered out entirely.

use std::sync::OnceLock;

use pipeline::incident::LogEntry;
use regex::Regex;
use serde_json::Value;

fn python_frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"File "([^"]+)", line \d+"#)
            .unwrap_or_else(|e| unreachable!("static python frame regex must compile: {e}"))
    })
}

fn js_frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"at (?:.*? \()?([^:)\s]+(?:\.js|\.ts|\.jsx|\.tsx)):\d+:\d+\)?")
            .unwrap_or_else(|e| unreachable!("static js frame regex must compile: {e}"))
    })
}

fn bundled_res() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"/_next/static/chunks/",
            r"/_next/static/.*\.js",
            r"webpack://",
            r"\.min\.js",
            r"chunk-[a-f0-9]+\.js",
        ]
        .iter()
        .map(|p| {
            Regex::new(p).unwrap_or_else(|e| unreachable!("static bundle regex must compile: {e}"))
        })
        .collect()
    })
}

/// Extract file paths from a stack trace string (Python and JS/TS frames),
/// skipping bundled artifacts.
pub fn extract_paths_from_stacktrace(text: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for caps in python_frame_re().captures_iter(text) {
        if let Some(m) = caps.get(1) {
            paths.push(m.as_str().to_string());
        }
    }
    for caps in js_frame_re().captures_iter(text) {
        if let Some(m) = caps.get(1) {
            let path = m.as_str();
            if !bundled_res().iter().any(|re| re.is_match(path)) {
                paths.push(path.to_string());
            }
        }
    }
    paths
}

/// Normalize a path to be relative to the repo root: strip protocols,
/// query strings, webpack and container prefixes, then re-anchor at a
/// recognizable project directory.
pub fn normalize_path(path: &str) -> String {
    let mut path = path.to_string();

    if let Some(idx) = path.find("://") {
        if path[..idx].eq_ignore_ascii_case("webpack") {
            path = path[idx + 3..].replace("./", "");
        } else {
            // Scheme+host URL: keep everything after the host.
            let rest = &path[idx + 3..];
            path = match rest.find('/') {
                Some(slash) => rest[slash..].to_string(),
                None => rest.to_string(),
            };
        }
    }
    if let Some(idx) = path.find('?') {
        path.truncate(idx);
    }

    for prefix in ["/usr/src/app/", "/app/"] {
        if let Some(stripped) = path.strip_prefix(prefix) {
            path = stripped.to_string();
        }
    }

    // Re-anchor at monorepo roots.
    for anchor in ["/apps/", "/packages/"] {
        if let Some(idx) = path.find(anchor) {
            path = format!("{}{}", &anchor[1..], &path[idx + anchor.len()..]);
            return path.trim_start_matches('/').to_string();
        }
    }
    if let Some(idx) = path.find("/src/") {
        if !path.starts_with("src/") {
            path = format!("src/{}", &path[idx + 5..]);
            return path.trim_start_matches('/').to_string();
        }
    }

    // Common web-app directories, for absolute paths that escaped the
    // anchors above (e.g. /Users/dev/project/app/page.tsx → app/page.tsx).
    if path.starts_with('/') {
        for dir in ["/app/", "/pages/", "/components/", "/lib/", "/utils/", "/public/", "/api/"] {
            if let Some(idx) = path.find(dir) {
                path = format!("{}{}", &dir[1..], &path[idx + dir.len()..]);
                break;
            }
        }
    }

    path.trim_start_matches('/').to_string()
}

/// Filter out dependency and build trees, normalize, optionally dedupe
/// preserving order.
pub fn filter_and_normalize_paths(paths: &[String], dedupe: bool) -> Vec<String> {
    let mut out = Vec::new();
    for path in paths {
        if path.is_empty() || path.contains("/node_modules/") || path.contains("/.next/") {
            continue;
        }
        let normalized = normalize_path(path);
        if normalized.is_empty() {
            continue;
        }
        if dedupe && out.contains(&normalized) {
            continue;
        }
        out.push(normalized);
    }
    out
}

fn collect_paths_from_value(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if s.contains('/') && s.contains('.') && !s.contains(' ') && s.len() < 300 {
                let looks_like_code = [".ts", ".tsx", ".js", ".jsx", ".py", ".rs", ".go", ".java"]
                    .iter()
                    .any(|ext| s.ends_with(ext));
                if looks_like_code {
                    out.push(s.clone());
                }
            } else if s.contains("at ") || s.contains("File \"") {
                out.extend(extract_paths_from_stacktrace(s));
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_paths_from_value(item, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                // Exception events carry the full trace under attributes.
                if key == "exception.stacktrace" {
                    if let Some(s) = item.as_str() {
                        out.extend(extract_paths_from_stacktrace(s));
                        continue;
                    }
                }
                collect_paths_from_value(item, out);
            }
        }
        _ => {}
    }
}

/// Extract candidate file paths from a log's message and metadata.
pub fn extract_file_paths_from_log(log: &LogEntry) -> Vec<String> {
    let mut raw = extract_paths_from_stacktrace(&log.message);
    collect_paths_from_value(&log.metadata, &mut raw);
    filter_and_normalize_paths(&raw, true)
}

/// Extract candidate file paths from incident metadata.
pub fn extract_file_paths_from_metadata(metadata: &Value) -> Vec<String> {
    let mut raw = Vec::new();
    collect_paths_from_value(metadata, &mut raw);
    filter_and_normalize_paths(&raw, true)
}
