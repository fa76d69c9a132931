//! Host-side execution of tool batches.
//!
//! Sequential within one loop, independent across incidents. Reads come
//! from the workspace first, then the repo adapter; writes touch the
//! workspace only. Path safety and quotas are enforced before any tool
//! runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pipeline::memory::FailsafeMemory;
use pipeline::workspace::Workspace;
use tracing::{debug, warn};

use super::protocol::{BatchOutcome, ErrorType, ToolInvocation, ToolOutcome};
use crate::adapters::RepoHost;
use crate::paths::normalize_path;

/// Max invocations in one batch.
const MAX_BATCH_INVOCATIONS: usize = 20;
/// Max bytes accepted by `write_file`.
const MAX_WRITE_BYTES: usize = 256 * 1024;
/// Max entries returned by `list_files`.
const MAX_LISTED_FILES: usize = 200;

/// Path prefixes that signal the model is guessing container paths.
const FORBIDDEN_PREFIXES: [&str; 5] = ["/app/", "/dist/", "/usr/", "/workspace/", "/home/"];

/// Shared dependencies of the executor.
pub struct ExecutorDeps {
    pub repo: Option<Arc<dyn RepoHost>>,
    pub repo_name: Option<String>,
    pub git_ref: String,
    pub memory: Arc<FailsafeMemory>,
    /// Repo file index used by `list_files` and symbol search.
    pub file_index: Vec<String>,
}

/// Executes validated tool batches.
pub struct ToolExecutor {
    deps: ExecutorDeps,
    batch_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(deps: ExecutorDeps, batch_timeout: Duration) -> Self {
        Self {
            deps,
            batch_timeout,
        }
    }

    /// Validate and normalize a tool path. Absolute and container-prefixed
    /// paths are rejected with hints.
    fn check_path(path: &str) -> Result<String, BatchOutcome> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(BatchOutcome::failure(
                ErrorType::PathError,
                "empty path",
                vec!["Pass a repo-relative path like src/main.ts.".to_string()],
            ));
        }
        let forbidden = trimmed.starts_with('/')
            || FORBIDDEN_PREFIXES.iter().any(|p| trimmed.starts_with(p));
        if forbidden || trimmed.contains("..") {
            let suggestion = normalize_path(trimmed);
            return Err(BatchOutcome::failure(
                ErrorType::PathError,
                format!("path `{trimmed}` is not repo-relative"),
                vec![
                    "Use relative paths from the repository root (e.g. \
                     'dist/src/package.json', not '/app/dist/src/package.json')."
                        .to_string(),
                    format!("Did you mean `{suggestion}`?"),
                ],
            ));
        }
        Ok(trimmed.to_string())
    }

    /// Execute a batch under the wall-clock budget.
    pub async fn execute_batch(
        &self,
        batch: &[ToolInvocation],
        workspace: &mut Workspace,
    ) -> BatchOutcome {
        if batch.len() > MAX_BATCH_INVOCATIONS {
            return BatchOutcome::failure(
                ErrorType::Quota,
                format!(
                    "batch of {} invocations exceeds the limit of {MAX_BATCH_INVOCATIONS}",
                    batch.len()
                ),
                vec!["Split the work into smaller batches.".to_string()],
            );
        }
        match tokio::time::timeout(self.batch_timeout, self.run_batch(batch, workspace)).await {
            Ok(outcome) => outcome,
            Err(_) => BatchOutcome::failure(
                ErrorType::Timeout,
                format!(
                    "tool batch exceeded the {}s execution budget",
                    self.batch_timeout.as_secs()
                ),
                vec!["Do less work per step: read fewer files or make smaller edits.".to_string()],
            ),
        }
    }

    async fn run_batch(
        &self,
        batch: &[ToolInvocation],
        workspace: &mut Workspace,
    ) -> BatchOutcome {
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut files_written: BTreeMap<String, String> = BTreeMap::new();

        for invocation in batch {
            debug!(tool = invocation.tool_name(), "executing tool");
            let result = self
                .run_one(invocation, workspace, &mut files_written)
                .await;
            match result {
                Ok(output) => outcomes.push(ToolOutcome {
                    tool: invocation.tool_name().to_string(),
                    success: true,
                    output,
                    error: None,
                }),
                Err(failure) => {
                    // A failing invocation fails the batch, but partial
                    // writes are still declared so the workspace stays
                    // truthful.
                    let mut failure = failure;
                    failure.files = files_written;
                    failure.outcomes = outcomes;
                    return failure;
                }
            }
        }

        let summary = outcomes
            .iter()
            .map(|o| {
                let preview: String = o.output.chars().take(120).collect();
                format!("{}: {}", o.tool, preview)
            })
            .collect::<Vec<_>>()
            .join("\n");
        BatchOutcome {
            success: true,
            result: summary,
            error: None,
            error_type: None,
            error_hints: Vec::new(),
            files: files_written,
            outcomes,
        }
    }

    async fn run_one(
        &self,
        invocation: &ToolInvocation,
        workspace: &mut Workspace,
        files_written: &mut BTreeMap<String, String>,
    ) -> Result<String, BatchOutcome> {
        match invocation {
            ToolInvocation::ReadFile {
                path,
                start_line,
                end_line,
            } => {
                let path = Self::check_path(path)?;
                let content = self.load_file(&path, workspace).await.ok_or_else(|| {
                    BatchOutcome::failure(
                        ErrorType::ExecutionError,
                        format!("File not found: {path}"),
                        vec![
                            "Check the path against list_files output.".to_string(),
                            "Paths are relative to the repository root.".to_string(),
                        ],
                    )
                })?;
                workspace.set_file(&path, &content);
                Ok(slice_lines(&content, *start_line, *end_line))
            }
            ToolInvocation::WriteFile { path, content } => {
                let path = Self::check_path(path)?;
                if content.len() > MAX_WRITE_BYTES {
                    return Err(BatchOutcome::failure(
                        ErrorType::Quota,
                        format!(
                            "write of {} bytes to `{path}` exceeds the {MAX_WRITE_BYTES}-byte limit",
                            content.len()
                        ),
                        vec!["Write smaller files or use incremental edits.".to_string()],
                    ));
                }
                workspace.set_file(&path, content);
                files_written.insert(path.clone(), content.clone());
                Ok(format!("wrote {} bytes to {path} (workspace only)", content.len()))
            }
            ToolInvocation::ApplyIncrementalEdit { path, find, replace } => {
                let path = Self::check_path(path)?;
                let content = self.load_file(&path, workspace).await.ok_or_else(|| {
                    BatchOutcome::failure(
                        ErrorType::ExecutionError,
                        format!("File not found: {path}"),
                        vec!["Read the file first to confirm the path.".to_string()],
                    )
                })?;
                if !content.contains(find.as_str()) {
                    let snippet: String = find.chars().take(80).collect();
                    return Err(BatchOutcome::failure(
                        ErrorType::ExecutionError,
                        format!("edit target not found in `{path}`: {snippet}"),
                        vec![
                            "Read the file and copy the target text exactly, including \
                             whitespace."
                                .to_string(),
                        ],
                    ));
                }
                let updated = content.replacen(find.as_str(), replace.as_str(), 1);
                workspace.set_file(&path, &updated);
                files_written.insert(path.clone(), updated);
                Ok(format!("applied edit to {path}"))
            }
            ToolInvocation::ValidateCode { path, content } => {
                let path = Self::check_path(path)?;
                let text = match content {
                    Some(text) => text.clone(),
                    None => self.load_file(&path, workspace).await.ok_or_else(|| {
                        BatchOutcome::failure(
                            ErrorType::ExecutionError,
                            format!("File not found: {path}"),
                            vec!["Write or read the file before validating it.".to_string()],
                        )
                    })?,
                };
                let issues = validate_source(&path, &text);
                if issues.is_empty() {
                    Ok(format!("{path}: no issues found"))
                } else {
                    Ok(format!("{path}: {}", issues.join("; ")))
                }
            }
            ToolInvocation::FindSymbolDefinition { symbol, current_file } => {
                let mut hits = Vec::new();
                // Workspace contents first: the freshest view.
                for (path, content) in workspace.files() {
                    for (line_no, line) in content.lines().enumerate() {
                        if line_defines_symbol(line, symbol) {
                            hits.push(format!("{path}:{}: {}", line_no + 1, line.trim()));
                        }
                    }
                }
                // Then a repo code search when available.
                if hits.is_empty() {
                    if let (Some(repo), Some(repo_name)) =
                        (&self.deps.repo, &self.deps.repo_name)
                    {
                        match repo.search_code(repo_name, symbol).await {
                            Ok(paths) => hits.extend(paths.into_iter().take(5)),
                            Err(e) => warn!(symbol, error = %e, "symbol search failed"),
                        }
                    }
                }
                if hits.is_empty() {
                    let near = current_file
                        .as_deref()
                        .map(|f| format!(" (searched near {f})"))
                        .unwrap_or_default();
                    Ok(format!("no definition found for `{symbol}`{near}"))
                } else {
                    hits.truncate(10);
                    Ok(hits.join("\n"))
                }
            }
            ToolInvocation::UpdateTodo {
                step_number,
                status,
                result,
            } => {
                let parsed = match status.as_str() {
                    "pending" => pipeline::planner::StepStatus::Pending,
                    "in_progress" => pipeline::planner::StepStatus::InProgress,
                    "completed" => pipeline::planner::StepStatus::Completed,
                    "failed" => pipeline::planner::StepStatus::Failed,
                    "skipped" => pipeline::planner::StepStatus::Skipped,
                    other => {
                        return Err(BatchOutcome::failure(
                            ErrorType::SchemaError,
                            format!("unknown todo status `{other}`"),
                            vec![
                                "Use one of: pending, in_progress, completed, failed, skipped."
                                    .to_string(),
                            ],
                        ))
                    }
                };
                workspace.update_todo_step(*step_number, parsed, result.as_deref());
                Ok(format!("step {step_number} marked {status}"))
            }
            ToolInvocation::RetrieveMemory { error_signature } => {
                let context = self.deps.memory.retrieve_context(error_signature).await;
                if context.known_fixes.is_empty() && context.past_errors.is_empty() {
                    Ok("no memory for this signature".to_string())
                } else {
                    let mut lines = Vec::new();
                    for (i, fix) in context.known_fixes.iter().take(3).enumerate() {
                        lines.push(format!("fix #{}: {}", i + 1, fix.description));
                    }
                    for (i, err) in context.past_errors.iter().take(2).enumerate() {
                        let preview: String = err.context.chars().take(200).collect();
                        lines.push(format!("past error #{}: {preview}", i + 1));
                    }
                    Ok(lines.join("\n"))
                }
            }
            ToolInvocation::ListFiles { directory, max_depth } => {
                let prefix = directory.as_deref().unwrap_or("").trim_matches('/');
                let depth_limit = max_depth.unwrap_or(2) as usize;
                let mut listed: Vec<&String> = self
                    .deps
                    .file_index
                    .iter()
                    .filter(|p| prefix.is_empty() || p.starts_with(&format!("{prefix}/")))
                    .filter(|p| {
                        let relative_depth = p
                            .strip_prefix(prefix)
                            .unwrap_or(p)
                            .trim_start_matches('/')
                            .matches('/')
                            .count();
                        relative_depth <= depth_limit
                    })
                    .collect();
                listed.truncate(MAX_LISTED_FILES);
                if listed.is_empty() {
                    Ok(format!("no files under `{prefix}`"))
                } else {
                    Ok(listed
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join("\n"))
                }
            }
        }
    }

    /// Workspace first, then the repo adapter.
    async fn load_file(&self, path: &str, workspace: &Workspace) -> Option<String> {
        if let Some(content) = workspace.get_file(path) {
            return Some(content.to_string());
        }
        let (repo, repo_name) = (self.deps.repo.as_ref()?, self.deps.repo_name.as_deref()?);
        match repo
            .get_file_contents(repo_name, path, &self.deps.git_ref)
            .await
        {
            Ok(content) => content,
            Err(e) => {
                warn!(path, error = %e, "repo read failed");
                None
            }
        }
    }
}

fn slice_lines(content: &str, start_line: Option<u32>, end_line: Option<u32>) -> String {
    if start_line.is_none() && end_line.is_none() {
        return content.to_string();
    }
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    let start = start_line
        .map(|n| (n as usize).saturating_sub(1))
        .unwrap_or(0)
        .min(total);
    let end = end_line.map(|n| (n as usize).min(total)).unwrap_or(total);
    if start >= end {
        return format!("[empty range: lines {start}..{end} of {total}]");
    }
    lines[start..end].join("\n")
}

fn line_defines_symbol(line: &str, symbol: &str) -> bool {
    let mut trimmed = line.trim_start();
    for modifier in ["export ", "default ", "pub ", "pub(crate) ", "async ", "static ", "abstract "] {
        if let Some(rest) = trimmed.strip_prefix(modifier) {
            trimmed = rest;
        }
    }
    [
        format!("fn {symbol}"),
        format!("def {symbol}"),
        format!("class {symbol}"),
        format!("function {symbol}"),
        format!("const {symbol}"),
        format!("let {symbol}"),
        format!("var {symbol}"),
        format!("interface {symbol}"),
        format!("type {symbol}"),
        format!("struct {symbol}"),
        format!("enum {symbol}"),
    ]
    .iter()
    .any(|prefix| trimmed.starts_with(prefix.as_str()))
}

/// Lightweight structural checks: balanced brackets outside strings, and a
/// few language-specific danger patterns.
fn validate_source(path: &str, text: &str) -> Vec<String> {
    let mut issues = Vec::new();
    let mut parens: i64 = 0;
    let mut braces: i64 = 0;
    let mut brackets: i64 = 0;
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match (in_string, c) {
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => in_string = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') | (None, '`') => in_string = Some(c),
            (None, '(') => parens += 1,
            (None, ')') => parens -= 1,
            (None, '{') => braces += 1,
            (None, '}') => braces -= 1,
            (None, '[') => brackets += 1,
            (None, ']') => brackets -= 1,
            _ => {}
        }
    }
    if parens != 0 {
        issues.push(format!("unbalanced parentheses ({parens:+})"));
    }
    if braces != 0 {
        issues.push(format!("unbalanced braces ({braces:+})"));
    }
    if brackets != 0 {
        issues.push(format!("unbalanced brackets ({brackets:+})"));
    }
    if text.trim().is_empty() {
        issues.push("file is empty".to_string());
    }
    if (path.ends_with(".ts") || path.ends_with(".tsx")) && text.contains("<<<<<<<") {
        issues.push("unresolved merge conflict markers".to_string());
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::memory::InMemoryMemoryStore;
    use pipeline::memory::MemoryStore;
    use pipeline::planner::{PlanStep, StepStatus};

    fn deps_with_index(index: Vec<&str>) -> ExecutorDeps {
        ExecutorDeps {
            repo: None,
            repo_name: None,
            git_ref: "main".into(),
            memory: Arc::new(FailsafeMemory::new(Arc::new(InMemoryMemoryStore::new()))),
            file_index: index.into_iter().map(str::to_string).collect(),
        }
    }

    fn executor(index: Vec<&str>) -> ToolExecutor {
        ToolExecutor::new(deps_with_index(index), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn write_then_read_round_trip_and_files_declared() {
        let exec = executor(vec![]);
        let mut ws = Workspace::new(1);
        let batch = vec![
            ToolInvocation::WriteFile {
                path: "src/fix.ts".into(),
                content: "export const ok = true;".into(),
            },
            ToolInvocation::ReadFile {
                path: "src/fix.ts".into(),
                start_line: None,
                end_line: None,
            },
        ];
        let outcome = exec.execute_batch(&batch, &mut ws).await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(ws.get_file("src/fix.ts"), Some("export const ok = true;"));
        assert_eq!(outcome.outcomes.len(), 2);
    }

    #[tokio::test]
    async fn absolute_paths_are_rejected_with_hints() {
        let exec = executor(vec![]);
        let mut ws = Workspace::new(1);
        let batch = vec![ToolInvocation::ReadFile {
            path: "/app/dist/src/package.json".into(),
            start_line: None,
            end_line: None,
        }];
        let outcome = exec.execute_batch(&batch, &mut ws).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_type, Some(ErrorType::PathError));
        assert!(outcome
            .error_hints
            .iter()
            .any(|h| h.contains("dist/src/package.json")));
    }

    #[tokio::test]
    async fn incremental_edit_replaces_one_occurrence() {
        let exec = executor(vec![]);
        let mut ws = Workspace::new(1);
        ws.set_file("src/a.ts", "const a = 1;\nconst b = 1;\n");
        let batch = vec![ToolInvocation::ApplyIncrementalEdit {
            path: "src/a.ts".into(),
            find: "const a = 1;".into(),
            replace: "const a = 2;".into(),
        }];
        let outcome = exec.execute_batch(&batch, &mut ws).await;
        assert!(outcome.success);
        assert_eq!(ws.get_file("src/a.ts").unwrap(), "const a = 2;\nconst b = 1;\n");
        assert!(outcome.files.contains_key("src/a.ts"));
    }

    #[tokio::test]
    async fn edit_with_missing_target_fails_with_hint() {
        let exec = executor(vec![]);
        let mut ws = Workspace::new(1);
        ws.set_file("src/a.ts", "const a = 1;");
        let batch = vec![ToolInvocation::ApplyIncrementalEdit {
            path: "src/a.ts".into(),
            find: "const z = 9;".into(),
            replace: "x".into(),
        }];
        let outcome = exec.execute_batch(&batch, &mut ws).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_type, Some(ErrorType::ExecutionError));
    }

    #[tokio::test]
    async fn missing_file_read_reports_file_not_found() {
        let exec = executor(vec![]);
        let mut ws = Workspace::new(1);
        let batch = vec![ToolInvocation::ReadFile {
            path: "src/nope.ts".into(),
            start_line: None,
            end_line: None,
        }];
        let outcome = exec.execute_batch(&batch, &mut ws).await;
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap_or("").contains("File not found"));
    }

    #[tokio::test]
    async fn oversized_batch_hits_quota() {
        let exec = executor(vec![]);
        let mut ws = Workspace::new(1);
        let batch: Vec<ToolInvocation> = (0..25)
            .map(|i| ToolInvocation::ReadFile {
                path: format!("src/f{i}.ts"),
                start_line: None,
                end_line: None,
            })
            .collect();
        let outcome = exec.execute_batch(&batch, &mut ws).await;
        assert_eq!(outcome.error_type, Some(ErrorType::Quota));
    }

    #[tokio::test]
    async fn update_todo_mutates_workspace_plan() {
        let exec = executor(vec![]);
        let mut ws = Workspace::new(1);
        ws.set_plan(vec![PlanStep::new(1, "read"), PlanStep::new(2, "fix")]);
        let batch = vec![ToolInvocation::UpdateTodo {
            step_number: 1,
            status: "completed".into(),
            result: Some("read everything".into()),
        }];
        let outcome = exec.execute_batch(&batch, &mut ws).await;
        assert!(outcome.success);
        assert_eq!(ws.plan().unwrap()[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn retrieve_memory_surfaces_known_fixes() {
        let store = Arc::new(InMemoryMemoryStore::new());
        store.store_fix("sig1", "add retry", "patch").await.unwrap();
        let deps = ExecutorDeps {
            repo: None,
            repo_name: None,
            git_ref: "main".into(),
            memory: Arc::new(FailsafeMemory::new(store)),
            file_index: vec![],
        };
        let exec = ToolExecutor::new(deps, Duration::from_secs(30));
        let mut ws = Workspace::new(1);
        let batch = vec![ToolInvocation::RetrieveMemory {
            error_signature: "sig1".into(),
        }];
        let outcome = exec.execute_batch(&batch, &mut ws).await;
        assert!(outcome.success);
        assert!(outcome.result.contains("add retry"));
    }

    #[tokio::test]
    async fn list_files_filters_by_directory_and_depth() {
        let exec = executor(vec![
            "src/a.ts",
            "src/deep/nested/far/away.ts",
            "docs/readme.md",
        ]);
        let mut ws = Workspace::new(1);
        let batch = vec![ToolInvocation::ListFiles {
            directory: Some("src".into()),
            max_depth: Some(1),
        }];
        let outcome = exec.execute_batch(&batch, &mut ws).await;
        assert!(outcome.success);
        assert!(outcome.result.contains("src/a.ts"));
        assert!(!outcome.result.contains("far/away.ts"));
        assert!(!outcome.result.contains("docs/readme.md"));
    }

    #[tokio::test]
    async fn validation_flags_unbalanced_braces() {
        let exec = executor(vec![]);
        let mut ws = Workspace::new(1);
        ws.set_file("src/bad.ts", "function f() { if (x) { return 1; }");
        let batch = vec![ToolInvocation::ValidateCode {
            path: "src/bad.ts".into(),
            content: None,
        }];
        let outcome = exec.execute_batch(&batch, &mut ws).await;
        assert!(outcome.success);
        assert!(outcome.result.contains("unbalanced braces"));
    }

    #[tokio::test]
    async fn read_falls_back_to_repo_host() {
        let mut repo = crate::adapters::MockRepoHost::new();
        repo.expect_get_file_contents()
            .returning(|_, path, _| match path {
                "src/remote.ts" => Ok(Some("remote content".to_string())),
                _ => Ok(None),
            });
        let deps = ExecutorDeps {
            repo: Some(Arc::new(repo)),
            repo_name: Some("acme/svc".into()),
            git_ref: "main".into(),
            memory: Arc::new(FailsafeMemory::new(Arc::new(InMemoryMemoryStore::new()))),
            file_index: vec![],
        };
        let exec = ToolExecutor::new(deps, Duration::from_secs(30));
        let mut ws = Workspace::new(1);
        let batch = vec![ToolInvocation::ReadFile {
            path: "src/remote.ts".into(),
            start_line: None,
            end_line: None,
        }];
        let outcome = exec.execute_batch(&batch, &mut ws).await;
        assert!(outcome.success);
        assert!(outcome.result.contains("remote content"));
        // The read warms the workspace cache.
        assert_eq!(ws.get_file("src/remote.ts"), Some("remote content"));
    }

    #[tokio::test]
    async fn symbol_definition_found_in_workspace() {
        let exec = executor(vec![]);
        let mut ws = Workspace::new(1);
        ws.set_file("src/user.ts", "export class UserService {\n}\n");
        let batch = vec![ToolInvocation::FindSymbolDefinition {
            symbol: "UserService".into(),
            current_file: None,
        }];
        let outcome = exec.execute_batch(&batch, &mut ws).await;
        assert!(outcome.success);
        assert!(outcome.result.contains("src/user.ts:1"));
    }
}
