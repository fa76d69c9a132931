//! The agent loop: analyze → plan → execute → observe, one action per
//! iteration, under per-step and whole-run timeouts.
//!
//! One loop owns one incident's Workspace and EventStream exclusively;
//! loops for distinct incidents share nothing mutable. The loop never
//! touches the ledger; the worker claims before calling [`AgentLoop::run`]
//! and settles afterward from the returned status.

use std::collections::BTreeMap;
use std::sync::Arc;

use pipeline::events::{EventStream, EventType};
use pipeline::fingerprint::{classify_error_type, fingerprint};
use pipeline::incident::{Incident, LogEntry};
use pipeline::knowledge::KnowledgeRetriever;
use pipeline::memory::{FailsafeMemory, MemoryContext, WorkspaceContext};
use pipeline::planner::{CompletionClient, PlanProgress, StepStatus, TaskPlanner};
use pipeline::scratchpad::Scratchpad;
use pipeline::storage::RunArtifactStore;
use pipeline::telemetry::{Phase, PhaseTracker};
use pipeline::workspace::Workspace;
use serde_json::json;
use tracing::{error, info, warn};

use crate::adapters::RepoHost;
use crate::agents::AgentRecord;
use crate::analysis::detect_languages;
use crate::classifier::{build_skipped_resolution_description_with, ExternalCodeClassifier};
use crate::config::EngineConfig;
use crate::paths::{extract_file_paths_from_log, extract_file_paths_from_metadata};
use crate::toolcall::{parse_tool_batch, BatchOutcome, ErrorType, ExecutorDeps, ToolExecutor};

/// Consecutive failures that trigger a replan.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// Files preloaded into step context.
const MAX_PRELOADED_FILES: usize = 10;
/// Line cap per preloaded file; oversize files show head and tail.
const MAX_PRELOADED_LINES: usize = 2000;

/// Final status of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Plan fully completed.
    Success,
    /// Iterations exhausted with some progress.
    Partial,
    /// Run failed (timeout or unrecoverable error).
    Error,
    /// External-code guard fired; nothing attempted.
    SkippedExternal,
}

/// Everything a run returns to the worker.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub iterations: u32,
    pub plan_progress: PlanProgress,
    /// Workspace files at the end of the run, the candidate fix.
    pub fixes: BTreeMap<String, String>,
    pub events: Vec<pipeline::events::AgentEvent>,
    pub workspace_state: String,
    pub fingerprint: String,
    /// Set when the guard fired: the "why we didn't auto-resolve" document.
    pub skip_explanation: Option<String>,
    /// Which timeout tier fired, when status is Error from a timeout.
    pub timeout_type: Option<&'static str>,
}

/// Dependencies of the loop, shared across runs.
pub struct AgentLoopDeps {
    pub llm: Arc<dyn CompletionClient>,
    pub small_llm: Arc<dyn CompletionClient>,
    pub repo: Option<Arc<dyn RepoHost>>,
    pub memory: Arc<FailsafeMemory>,
    pub knowledge: Arc<KnowledgeRetriever>,
    pub artifacts: Option<Arc<dyn RunArtifactStore>>,
    pub config: EngineConfig,
}

/// Per-run mutable state, owned by exactly one loop.
struct RunState {
    events: EventStream,
    workspace: Workspace,
    planner: TaskPlanner,
    consecutive_failures: u32,
    iterations: u32,
    file_not_found_streak: u32,
    root_cause: String,
    affected_files: Vec<String>,
    memory_context: MemoryContext,
    repo_name: Option<String>,
}

/// The orchestrator.
pub struct AgentLoop {
    deps: AgentLoopDeps,
    agents: Vec<AgentRecord>,
}

impl AgentLoop {
    pub fn new(deps: AgentLoopDeps) -> Self {
        let agents = vec![
            AgentRecord::new("planner", "task_planner"),
            AgentRecord::new("code_fixer", "code_fixer"),
            AgentRecord::new("validator", "fix_validator"),
        ];
        Self { deps, agents }
    }

    pub fn agents(&self) -> &[AgentRecord] {
        &self.agents
    }

    /// Run one resolution attempt end to end.
    pub async fn run(
        &mut self,
        incident: &Incident,
        logs: &[LogEntry],
        root_cause: &str,
    ) -> RunOutcome {
        let mut phases = PhaseTracker::new(incident.id);
        let incident_fingerprint = fingerprint(incident, logs);

        // --- External-code guard: before any expensive work. ---
        let classifier = ExternalCodeClassifier::new(self.deps.small_llm.as_ref());
        let (external, sample_trace) = classifier
            .is_incident_from_external_code(incident, logs)
            .await;
        if external {
            info!(incident_id = incident.id, "external-code guard fired, skipping run");
            let explanation = build_skipped_resolution_description_with(
                self.deps.small_llm.as_ref(),
                incident,
                &sample_trace,
            )
            .await;
            return RunOutcome {
                status: RunStatus::SkippedExternal,
                iterations: 0,
                plan_progress: TaskPlanner::new(incident.id).get_progress(),
                fixes: BTreeMap::new(),
                events: Vec::new(),
                workspace_state: String::new(),
                fingerprint: incident_fingerprint,
                skip_explanation: Some(explanation),
                timeout_type: None,
            };
        }

        // --- Preparation. ---
        let mut state = RunState {
            events: EventStream::new(incident.id, self.deps.config.max_event_stream_size),
            workspace: Workspace::new(incident.id),
            planner: TaskPlanner::new(incident.id),
            consecutive_failures: 0,
            iterations: 0,
            file_not_found_streak: 0,
            root_cause: root_cause.to_string(),
            affected_files: Vec::new(),
            memory_context: MemoryContext::default(),
            repo_name: incident.repo_name.clone(),
        };
        state.events.add_event(
            EventType::UserRequest,
            json!({ "request": "Fix incident", "incident_id": incident.id, "root_cause": root_cause }),
            None,
        );
        for agent in &mut self.agents {
            let _ = agent.start_task(&format!("resolve incident {}", incident.id));
        }

        // Affected files from stack traces and metadata.
        let mut affected: Vec<String> = Vec::new();
        for log in logs {
            for path in extract_file_paths_from_log(log) {
                if !affected.contains(&path) {
                    affected.push(path);
                }
            }
        }
        for path in extract_file_paths_from_metadata(&incident.metadata) {
            if !affected.contains(&path) {
                affected.push(path);
            }
        }

        // Repo file index; empty is fine, the loop proceeds without it.
        let file_index = match (&self.deps.repo, &incident.repo_name) {
            (Some(repo), Some(repo_name)) => {
                match repo.get_repo_structure(repo_name, "", "main", 10).await {
                    Ok(paths) => paths,
                    Err(e) => {
                        warn!(incident_id = incident.id, error = %e, "repo index unavailable");
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };

        // Memory warm start.
        phases.start(Phase::MemoryRetrieveStart);
        let memory_context = self
            .deps
            .memory
            .retrieve_context(&incident_fingerprint)
            .await;
        let error_type = classify_error_type(&incident_fingerprint, root_cause);
        self.deps
            .memory
            .set_error_type(&incident_fingerprint, &error_type)
            .await;
        if !memory_context.known_fixes.is_empty() || !memory_context.past_errors.is_empty() {
            state.events.add_event(
                EventType::MemoryRetrieved,
                json!({
                    "fingerprint": incident_fingerprint,
                    "known_fixes": memory_context.known_fixes.len(),
                    "past_errors": memory_context.past_errors.len(),
                }),
                None,
            );
        }
        if let Some(pattern) = self.deps.memory.get_learning_pattern(&error_type).await {
            info!(
                incident_id = incident.id,
                error_type,
                confidence = pattern.confidence_score,
                "learning pattern found"
            );
            for path in pattern
                .typical_files_read
                .iter()
                .chain(pattern.typical_files_modified.iter())
            {
                if !affected.contains(path) {
                    affected.push(path.clone());
                }
            }
        }
        phases.finish(Phase::MemoryRetrieveStart, Phase::MemoryRetrieved);

        // Knowledge indexing and planning retrieval.
        phases.start(Phase::KnowledgeIndexStart);
        let past_fix_texts: Vec<String> = memory_context
            .known_fixes
            .iter()
            .map(|f| format!("{}\n{}", f.description, f.patch))
            .collect();
        self.deps.knowledge.index_past_fixes(&past_fix_texts).await;
        if !file_index.is_empty() {
            let scoped: Vec<String> = file_index.iter().take(200).cloned().collect();
            self.deps.knowledge.index_codebase_patterns(&scoped).await;
        }
        let planning_knowledge = self
            .deps
            .knowledge
            .retrieve_for_planning(root_cause, &affected)
            .await;
        for item in &planning_knowledge {
            state.events.add_event(
                EventType::KnowledgeRetrieved,
                json!({
                    "content": item.content.chars().take(300).collect::<String>(),
                    "relevance": item.relevance_score,
                    "source": item.source.to_string(),
                }),
                None,
            );
        }
        phases.finish(Phase::KnowledgeIndexStart, Phase::KnowledgeIndexed);

        // Plan.
        phases.start(Phase::PlanCreateStart);
        let knowledge_context = self.build_knowledge_context(&planning_knowledge, &file_index);
        if let Err(e) = state
            .planner
            .create_plan(
                root_cause,
                &affected,
                self.deps.llm.as_ref(),
                Some(&knowledge_context),
            )
            .await
        {
            // create_plan only errs on internal invariants; the fallback
            // plan covers LLM failures.
            error!(incident_id = incident.id, error = %e, "plan creation failed");
        }
        state.events.add_event(
            EventType::PlanCreated,
            json!({ "steps_count": state.planner.plan().len() }),
            Some("planner"),
        );
        state.workspace.set_plan(state.planner.plan().to_vec());
        phases.finish(Phase::PlanCreateStart, Phase::PlanCreated);

        let scratchpad = Scratchpad::local(incident.id, &self.deps.config.scratchpad_dir);
        scratchpad.initialize(&state.planner.to_todo_md()).await;

        state.affected_files = affected;
        state.memory_context = memory_context;

        // --- The loop proper, under the crew deadline. ---
        phases.start(Phase::CrewStart);
        let crew_timeout = self.deps.config.crew_execution_timeout;
        let executor = ToolExecutor::new(
            ExecutorDeps {
                repo: self.deps.repo.clone(),
                repo_name: incident.repo_name.clone(),
                git_ref: "main".to_string(),
                memory: Arc::clone(&self.deps.memory),
                file_index: file_index.clone(),
            },
            self.deps.config.code_execution_timeout,
        );

        let loop_result =
            tokio::time::timeout(crew_timeout, self.iterate(&mut state, &executor)).await;
        let (status, timeout_type) = match loop_result {
            Ok(status) => {
                let phase = match status {
                    RunStatus::Success => Phase::CrewCompleted,
                    RunStatus::Error => Phase::CrewFailed,
                    _ => Phase::CrewCompleted,
                };
                phases.crew_ended(phase);
                (status, None)
            }
            Err(_elapsed) => {
                error!(
                    incident_id = incident.id,
                    timeout_secs = crew_timeout.as_secs(),
                    "crew execution timeout"
                );
                state.events.add_event(
                    EventType::Error,
                    json!({
                        "message": format!("crew execution exceeded {}s", crew_timeout.as_secs()),
                        "timeout_type": "crew_execution_timeout",
                    }),
                    None,
                );
                phases.crew_ended(Phase::CrewTimeout);
                (RunStatus::Error, Some("crew_execution_timeout"))
            }
        };

        // --- Post-run. ---
        state.workspace.set_plan(state.planner.plan().to_vec());
        scratchpad.sync_from_workspace(&state.workspace).await;

        if let Some(artifacts) = &self.deps.artifacts {
            let recent = state.events.all_events().to_vec();
            if let Err(e) = artifacts.persist_events(incident.id, &recent).await {
                warn!(incident_id = incident.id, error = %e, "event persistence failed");
            }
            let version = state.planner.replan_count() + 1;
            if let Err(e) = artifacts
                .persist_plan(incident.id, state.planner.plan(), version)
                .await
            {
                warn!(incident_id = incident.id, error = %e, "plan persistence failed");
            }
            if let Err(e) = artifacts.persist_workspace(&state.workspace.to_record()).await {
                warn!(incident_id = incident.id, error = %e, "workspace persistence failed");
            }
        }

        let fixes = state.workspace.files().clone();
        if status == RunStatus::Success && !fixes.is_empty() {
            let files_read: Vec<String> = state.affected_files.clone();
            let files_modified: Vec<String> = fixes.keys().cloned().collect();
            let patch = fixes
                .iter()
                .map(|(path, content)| {
                    format!("--- {path} ---\n{}", content.chars().take(2000).collect::<String>())
                })
                .collect::<Vec<_>>()
                .join("\n");
            self.deps
                .memory
                .store_fix_with_workspace(
                    &incident_fingerprint,
                    &format!("Fix for: {}", state.root_cause.chars().take(200).collect::<String>()),
                    &patch,
                    WorkspaceContext {
                        files_read,
                        files_modified,
                        context_files: file_index.iter().take(20).cloned().collect(),
                        changes: vec![],
                        incident_id: incident.id,
                    },
                )
                .await;
        }

        for agent in &mut self.agents {
            let _ = agent.finish_task(incident.id, status == RunStatus::Success);
        }

        RunOutcome {
            status,
            iterations: state.iterations,
            plan_progress: state.planner.get_progress(),
            fixes,
            events: state.events.all_events().to_vec(),
            workspace_state: state.workspace.get_workspace_state(),
            fingerprint: incident_fingerprint,
            skip_explanation: None,
            timeout_type,
        }
    }

    async fn iterate(&self, state: &mut RunState, executor: &ToolExecutor) -> RunStatus {
        let max_iterations = self.deps.config.max_agent_iterations;
        while state.iterations < max_iterations {
            state.iterations += 1;

            if state.planner.is_complete() {
                state.events.add_event(
                    EventType::PlanStepCompleted,
                    json!({ "message": "All plan steps completed", "iteration": state.iterations }),
                    None,
                );
                return RunStatus::Success;
            }
            let Some(step) = state.planner.get_current_step() else {
                break;
            };
            let step_number = step.step_number;
            let step_description = step.description.clone();
            let step_files = step.files_to_read.clone();
            let retry_count = step.retry_count;

            state.planner.mark_step_in_progress(step_number);
            state.events.add_event(
                EventType::PlanStepStarted,
                json!({
                    "step_number": step_number,
                    "description": step_description,
                    "iteration": state.iterations,
                }),
                Some("code_fixer"),
            );

            let context = self
                .build_step_context(state, &step_description, &step_files)
                .await;

            // One action under the per-step budget.
            let step_timeout = self.deps.config.agent_step_timeout;
            let outcome = match tokio::time::timeout(
                step_timeout,
                self.execute_action(&context, &step_description, state, executor),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_elapsed) => BatchOutcome::failure(
                    ErrorType::Timeout,
                    format!("step exceeded the {}s budget", step_timeout.as_secs()),
                    vec![],
                ),
            };

            state.events.add_event(
                EventType::Observation,
                json!({
                    "step_number": step_number,
                    "success": outcome.success,
                    "error": outcome.error,
                    "error_type": outcome.error_type.map(|t| t.to_string()),
                }),
                None,
            );

            if !outcome.files.is_empty() {
                state.workspace.apply_files_written(&outcome.files);
                state.events.add_event(
                    EventType::WorkspaceUpdated,
                    json!({ "files_written": outcome.files.keys().collect::<Vec<_>>() }),
                    None,
                );
            }

            if outcome.success {
                state.file_not_found_streak = 0;
                state.consecutive_failures = 0;
                let result_preview: String = outcome.result.chars().take(500).collect();
                state
                    .planner
                    .mark_step_completed(step_number, Some(&result_preview));
                state
                    .workspace
                    .update_todo_step(step_number, StepStatus::Completed, Some(&result_preview));
                state.planner.advance_to_next_step();
                state.events.add_event(
                    EventType::PlanStepCompleted,
                    json!({
                        "step_number": step_number,
                        "result": result_preview,
                        "iteration": state.iterations,
                    }),
                    Some("code_fixer"),
                );
                continue;
            }

            // --- Failure handling. ---
            let error_text = outcome.error.clone().unwrap_or_else(|| "unknown error".into());
            let classified = classify_step_error(outcome.error_type, &error_text);

            // Repeated file-not-found: stop retrying, hint at path format.
            if error_text.contains("File not found") {
                state.file_not_found_streak += 1;
                if state.file_not_found_streak >= 3 {
                    let hint = format!(
                        "{error_text}\n\nStopped after multiple attempts. Use relative paths \
                         from the repository root (e.g. 'dist/src/package.json', not \
                         '/app/dist/src/package.json')."
                    );
                    state.planner.mark_step_failed(step_number, &hint);
                    state
                        .workspace
                        .update_todo_step(step_number, StepStatus::Failed, None);
                    state.events.add_event(
                        EventType::PlanStepFailed,
                        json!({
                            "step_number": step_number,
                            "error": error_text,
                            "message": "Failed after repeated file path errors",
                            "iteration": state.iterations,
                        }),
                        None,
                    );
                    state.planner.advance_to_next_step();
                    state.file_not_found_streak = 0;
                    continue;
                }
            }

            let should_retry = match classified {
                StepErrorClass::Retryable => retry_count < self.deps.config.max_retries_per_step,
                StepErrorClass::Critical => false,
                StepErrorClass::NonRetryable => retry_count < 1,
            };

            if should_retry {
                state.planner.increment_retry(step_number);
                state.events.add_event(
                    EventType::Error,
                    json!({
                        "message": format!(
                            "Retrying step {step_number} (attempt {})",
                            retry_count + 1
                        ),
                        "error": error_text,
                        "error_hints": outcome.error_hints,
                        "iteration": state.iterations,
                    }),
                    None,
                );
                continue;
            }

            state.planner.mark_step_failed(step_number, &error_text);
            state
                .workspace
                .update_todo_step(step_number, StepStatus::Failed, None);
            state.consecutive_failures += 1;
            state.planner.advance_to_next_step();
            state.events.add_event(
                EventType::PlanStepFailed,
                json!({
                    "step_number": step_number,
                    "error": error_text,
                    "iteration": state.iterations,
                }),
                None,
            );

            let should_replan = state.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
                || classified == StepErrorClass::Critical;
            if should_replan {
                let reason = if classified == StepErrorClass::Critical {
                    "critical_error_discovered"
                } else {
                    "multiple_consecutive_failures"
                };
                self.trigger_replan(state, reason).await;
            }
        }

        if state.planner.is_complete() {
            RunStatus::Success
        } else if state.planner.get_progress().completed > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Error
        }
    }

    async fn trigger_replan(&self, state: &mut RunState, reason: &str) {
        state.events.add_event(
            EventType::PlanUpdated,
            json!({
                "reason": reason,
                "replan_count": state.planner.replan_count() + 1,
            }),
            Some("planner"),
        );
        let knowledge = self
            .deps
            .knowledge
            .retrieve_for_planning(&state.root_cause, &state.affected_files)
            .await;
        let knowledge_context: Option<String> = if knowledge.is_empty() {
            None
        } else {
            Some(
                knowledge
                    .iter()
                    .take(3)
                    .map(|k| k.content.chars().take(200).collect::<String>())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        };
        let root_cause = state.root_cause.clone();
        let affected = state.affected_files.clone();
        match state
            .planner
            .replan(
                reason,
                &root_cause,
                &affected,
                self.deps.llm.as_ref(),
                knowledge_context.as_deref(),
            )
            .await
        {
            Ok(plan) => {
                state.consecutive_failures = 0;
                let steps = plan.len();
                state.workspace.set_plan(plan.to_vec());
                state.events.add_event(
                    EventType::PlanCreated,
                    json!({ "is_replan": true, "reason": reason, "steps_count": steps }),
                    Some("planner"),
                );
            }
            Err(e) => {
                warn!(error = %e, "replan failed, continuing with current plan");
                state.events.add_event(
                    EventType::Error,
                    json!({ "message": format!("Replanning failed: {e}"), "reason": reason }),
                    None,
                );
            }
        }
    }

    async fn execute_action(
        &self,
        context: &str,
        step_description: &str,
        state: &mut RunState,
        executor: &ToolExecutor,
    ) -> BatchOutcome {
        let prompt = build_act_prompt(context, step_description);
        let reply = match self.deps.llm.complete(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                let text = e.to_string();
                let error_type = if text.contains("timeout") {
                    ErrorType::Timeout
                } else {
                    ErrorType::ExecutionError
                };
                return BatchOutcome::failure(error_type, format!("LLM call failed: {text}"), vec![]);
            }
        };
        state.events.add_event(
            EventType::AgentAction,
            json!({ "reply_preview": reply.chars().take(300).collect::<String>() }),
            Some("code_fixer"),
        );
        let batch = match parse_tool_batch(&reply) {
            Ok(batch) => batch,
            Err(failure) => return failure,
        };
        executor.execute_batch(&batch, &mut state.workspace).await
    }

    async fn build_step_context(
        &self,
        state: &RunState,
        step_description: &str,
        step_files: &[String],
    ) -> String {
        let mut sections: Vec<String> = Vec::new();

        // Highest priority: the root cause.
        sections.push(format!("## ROOT CAUSE\n{}", state.root_cause));

        // Preloaded file contents: the actual code, not just paths.
        let mut to_preload: Vec<String> = Vec::new();
        for path in step_files.iter().chain(state.affected_files.iter()) {
            if !to_preload.contains(path) {
                to_preload.push(path.clone());
            }
        }
        let preloaded = self
            .preload_files(&to_preload, &state.workspace, state.repo_name.as_deref())
            .await;
        if !preloaded.is_empty() {
            sections.push(preloaded);
        }

        if !to_preload.is_empty() {
            sections.push(format!("Files to analyze: {}", to_preload.join(", ")));
        }

        // Memory: top fixes and past errors.
        let memory = &state.memory_context;
        if !memory.known_fixes.is_empty() || !memory.past_errors.is_empty() {
            let mut lines = vec!["## MEMORY".to_string()];
            for (i, fix) in memory.known_fixes.iter().take(3).enumerate() {
                lines.push(format!("Fix #{}: {}", i + 1, fix.description));
                if !fix.patch.is_empty() {
                    let preview: String = fix.patch.chars().take(300).collect();
                    lines.push(format!("  Patch preview: {preview}"));
                }
            }
            for (i, err) in memory.past_errors.iter().take(2).enumerate() {
                let preview: String = err.context.chars().take(500).collect();
                lines.push(format!("Past error #{}: {preview}", i + 1));
            }
            sections.push(lines.join("\n"));
        }

        // Fresh knowledge for this step.
        let knowledge = self
            .deps
            .knowledge
            .retrieve_relevant_knowledge(step_description, 3)
            .await;
        if !knowledge.is_empty() {
            let lines: Vec<String> = knowledge
                .iter()
                .map(|k| {
                    format!(
                        "- [{} {:.2}] {}",
                        k.source,
                        k.relevance_score,
                        k.content.chars().take(300).collect::<String>()
                    )
                })
                .collect();
            sections.push(format!("## KNOWLEDGE\n{}", lines.join("\n")));
        }

        sections.push(format!(
            "## RECENT EVENTS\n{}",
            state.events.to_context_string(10)
        ));
        sections.push(state.workspace.get_workspace_state());

        sections.join("\n\n")
    }

    /// Load actual file contents, workspace first then repo, capped in
    /// count and size; oversize files show head and tail.
    async fn preload_files(
        &self,
        paths: &[String],
        workspace: &Workspace,
        repo_name: Option<&str>,
    ) -> String {
        if paths.is_empty() {
            return String::new();
        }
        let mut parts =
            vec!["## PRE-LOADED FILE CONTENTS (read these before making changes)".to_string()];
        let mut loaded = 0usize;
        for path in paths.iter().take(MAX_PRELOADED_FILES) {
            let content: Option<String> = match workspace.get_file(path) {
                Some(content) => Some(content.to_string()),
                None => match (&self.deps.repo, repo_name) {
                    (Some(repo), Some(repo_name)) => repo
                        .get_file_contents(repo_name, path, "main")
                        .await
                        .ok()
                        .flatten(),
                    _ => None,
                },
            };
            match content {
                Some(content) => {
                    let lines: Vec<&str> = content.lines().collect();
                    let preview = if lines.len() > MAX_PRELOADED_LINES {
                        let half = MAX_PRELOADED_LINES / 2;
                        format!(
                            "{}\n\n... ({} lines omitted) ...\n\n{}",
                            lines[..half].join("\n"),
                            lines.len() - MAX_PRELOADED_LINES,
                            lines[lines.len() - half..].join("\n")
                        )
                    } else {
                        content.clone()
                    };
                    parts.push(format!("### File: {path}\n```\n{preview}\n```"));
                    loaded += 1;
                }
                None => {
                    parts.push(format!("### File: {path}\n(could not load contents)"));
                }
            }
        }
        if loaded == 0 {
            return String::new();
        }
        if paths.len() > MAX_PRELOADED_FILES {
            parts.push(format!(
                "Only the first {MAX_PRELOADED_FILES} files are shown; read others with read_file."
            ));
        }
        parts.join("\n\n")
    }

    fn build_knowledge_context(
        &self,
        knowledge: &[pipeline::knowledge::KnowledgeItem],
        file_index: &[String],
    ) -> String {
        let mut parts = Vec::new();
        if !knowledge.is_empty() {
            parts.push(
                knowledge
                    .iter()
                    .take(5)
                    .map(|k| k.content.chars().take(200).collect::<String>())
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
        }
        if !file_index.is_empty() {
            let languages = detect_languages(file_index);
            if !languages.is_empty() {
                let names: Vec<String> = languages
                    .iter()
                    .take(3)
                    .map(|(lang, count)| format!("{lang} ({count} files)"))
                    .collect();
                parts.push(format!("Repository languages: {}", names.join(", ")));
            }
            let shown: Vec<&String> = file_index.iter().take(50).collect();
            parts.push(format!(
                "Available files ({} total, first {}):\n{}",
                file_index.len(),
                shown.len(),
                shown.iter().map(|s| format!("- {s}")).collect::<Vec<_>>().join("\n")
            ));
        }
        parts.join("\n\n")
    }
}

/// Error classes driving the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepErrorClass {
    Retryable,
    Critical,
    NonRetryable,
}

fn classify_step_error(error_type: Option<ErrorType>, error: &str) -> StepErrorClass {
    if matches!(error_type, Some(ErrorType::Timeout)) {
        return StepErrorClass::Retryable;
    }
    let lower = error.to_lowercase();
    const RETRYABLE: [&str; 7] = [
        "timeout",
        "network",
        "connection",
        "temporary",
        "rate limit",
        "429",
        "503",
    ];
    if RETRYABLE.iter().any(|k| lower.contains(k)) {
        return StepErrorClass::Retryable;
    }
    const CRITICAL: [&str; 4] = ["critical", "fatal", "cannot proceed", "impossible"];
    if CRITICAL.iter().any(|k| lower.contains(k)) {
        return StepErrorClass::Critical;
    }
    StepErrorClass::NonRetryable
}

fn build_act_prompt(context: &str, step_description: &str) -> String {
    format!(
        "{context}\n\n\
         ## YOUR TASK\n\
         Complete this step: {step_description}\n\n\
         ## HOW TO ACT\n\
         Reply with ONLY a JSON array of tool invocations. Available tools:\n\
         - {{\"tool\": \"read_file\", \"path\": \"...\", \"start_line\"?: n, \"end_line\"?: n}}\n\
         - {{\"tool\": \"write_file\", \"path\": \"...\", \"content\": \"...\"}} (workspace only, \
         never committed directly)\n\
         - {{\"tool\": \"apply_incremental_edit\", \"path\": \"...\", \"find\": \"exact text\", \
         \"replace\": \"new text\"}}\n\
         - {{\"tool\": \"validate_code\", \"path\": \"...\", \"content\"?: \"...\"}}\n\
         - {{\"tool\": \"find_symbol_definition\", \"symbol\": \"...\", \"current_file\"?: \"...\"}}\n\
         - {{\"tool\": \"update_todo\", \"step_number\": n, \"status\": \"completed\", \
         \"result\"?: \"...\"}}\n\
         - {{\"tool\": \"retrieve_memory\", \"error_signature\": \"...\"}}\n\
         - {{\"tool\": \"list_files\", \"directory\"?: \"...\", \"max_depth\"?: n}}\n\n\
         Rules:\n\
         - Use relative paths from the repository root (src/main.ts, not /app/src/main.ts).\n\
         - Match the language of the file you edit (.ts files get TypeScript, .py files get \
         Python).\n\
         - Read and understand files before editing them; never guess file contents.\n\
         - Keep the batch small and focused on this single step."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use pipeline::incident::{IncidentSeverity, IncidentStatus, LogSeverity};
    use pipeline::knowledge::HashEmbedder;
    use pipeline::memory::InMemoryMemoryStore;
    use std::sync::Mutex as StdMutex;

    /// LLM that replies from a script: first call gets the first entry, etc.
    struct ScriptedLlm {
        replies: StdMutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: StdMutex::new(replies.into_iter().rev().map(str::to_string).collect()),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedLlm {
        async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
            let mut replies = self.replies.lock().unwrap_or_else(|p| p.into_inner());
            match replies.pop() {
                Some(reply) => Ok(reply),
                None => Ok(r#"[{"tool": "list_files"}]"#.to_string()),
            }
        }
    }

    fn incident() -> Incident {
        let now = Utc::now();
        Incident {
            id: 1,
            title: "Crash".into(),
            description: String::new(),
            severity: IncidentSeverity::High,
            status: IncidentStatus::Open,
            service_name: "svc".into(),
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
            root_cause: Some("null deref".into()),
            action_taken: None,
            code_fix_explanation: None,
            pr_info: None,
        }
    }

    fn app_log() -> LogEntry {
        LogEntry {
            id: 1,
            timestamp: Utc::now(),
            service_name: "svc".into(),
            severity: LogSeverity::Error,
            message: "TypeError: boom\n    at handle (/app/src/api/users.ts:9:1)\n    at run (/app/src/index.ts:3:3)".into(),
            source: "app".into(),
            user_id: 7,
            integration_id: None,
            metadata: json!({}),
        }
    }

    fn deps(primary: ScriptedLlm, small: ScriptedLlm, scratch_dir: &std::path::Path) -> AgentLoopDeps {
        let mut config = EngineConfig::default();
        config.scratchpad_dir = scratch_dir.to_string_lossy().into_owned();
        config.max_agent_iterations = 20;
        AgentLoopDeps {
            llm: Arc::new(primary),
            small_llm: Arc::new(small),
            repo: None,
            memory: Arc::new(FailsafeMemory::new(Arc::new(InMemoryMemoryStore::new()))),
            knowledge: Arc::new(KnowledgeRetriever::new(Arc::new(HashEmbedder::new()))),
            artifacts: None,
            config,
        }
    }

    const NOT_EXTERNAL: &str = r#"{"is_node_modules": false}"#;

    #[tokio::test]
    async fn plan_executes_to_success() {
        let dir = tempfile::tempdir().unwrap();
        // One plan with two steps, then one tool batch per step.
        let primary = ScriptedLlm::new(vec![
            r#"[
                {"step_number": 1, "description": "Read the handler", "files_to_read": ["src/api/users.ts"]},
                {"step_number": 2, "description": "Write the fix"}
            ]"#,
            r#"[{"tool": "write_file", "path": "src/api/users.ts", "content": "read placeholder"}]"#,
            r#"[{"tool": "write_file", "path": "src/api/users.ts", "content": "export const fixed = true;"}]"#,
        ]);
        let small = ScriptedLlm::new(vec![NOT_EXTERNAL]);
        let mut agent_loop = AgentLoop::new(deps(primary, small, dir.path()));

        let outcome = agent_loop.run(&incident(), &[app_log()], "null deref").await;
        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.plan_progress.completed, 2);
        assert_eq!(
            outcome.fixes.get("src/api/users.ts").map(String::as_str),
            Some("export const fixed = true;")
        );
        assert!(outcome
            .events
            .iter()
            .any(|e| e.event_type == EventType::PlanStepCompleted));
        assert_eq!(outcome.fingerprint.len(), 16);
        // Agents returned to available.
        assert!(agent_loop
            .agents()
            .iter()
            .all(|a| a.state == crate::agents::AgentState::Available));
    }

    #[tokio::test]
    async fn external_code_guard_skips_run() {
        let dir = tempfile::tempdir().unwrap();
        let primary = ScriptedLlm::new(vec![]);
        let small = ScriptedLlm::new(vec![r#"{"is_node_modules": true}"#]);
        let mut agent_loop = AgentLoop::new(deps(primary, small, dir.path()));

        let mut log = app_log();
        log.message = "TypeError: x\n    at z (/app/node_modules/lib/a.js:1:1)\n    at q (/app/node_modules/lib/b.js:2:2)".into();
        let outcome = agent_loop.run(&incident(), &[log], "dep crash").await;

        assert_eq!(outcome.status, RunStatus::SkippedExternal);
        assert_eq!(outcome.iterations, 0);
        let explanation = outcome.skip_explanation.unwrap();
        assert!(explanation.starts_with("## Why we didn't auto-resolve this incident"));
        assert!(outcome.fixes.is_empty());
    }

    #[tokio::test]
    async fn schema_error_retries_once_then_fails_step() {
        let dir = tempfile::tempdir().unwrap();
        // Plan with one step; two unusable tool replies (non-retryable gets
        // exactly one retry), then exhaust iterations quickly.
        let primary = ScriptedLlm::new(vec![
            r#"[{"step_number": 1, "description": "Only step"}]"#,
            "I will not emit JSON.",
            "Still not JSON.",
        ]);
        let small = ScriptedLlm::new(vec![NOT_EXTERNAL]);
        let mut d = deps(primary, small, dir.path());
        d.config.max_agent_iterations = 3;
        let mut agent_loop = AgentLoop::new(d);

        let outcome = agent_loop.run(&incident(), &[app_log()], "x").await;
        assert_eq!(outcome.status, RunStatus::Error);
        assert_eq!(outcome.plan_progress.failed, 1);
        assert!(outcome
            .events
            .iter()
            .any(|e| e.event_type == EventType::PlanStepFailed));
        // The retry path logged an ERROR event before failing.
        assert!(outcome.events.iter().any(|e| e.event_type == EventType::Error));
    }

    #[tokio::test]
    async fn consecutive_failures_trigger_replan() {
        let dir = tempfile::tempdir().unwrap();
        // 3 steps; each step gets a non-retryable failure (one retry each);
        // after the third failed step, a replan is requested and served.
        let primary = ScriptedLlm::new(vec![
            r#"[
                {"step_number": 1, "description": "Step one"},
                {"step_number": 2, "description": "Step two"},
                {"step_number": 3, "description": "Step three"}
            ]"#,
            "junk", "junk",
            "junk", "junk",
            "junk", "junk",
            // The replan reply.
            r#"[{"step_number": 1, "description": "Fresh approach"}]"#,
            // And its execution.
            r#"[{"tool": "update_todo", "step_number": 4, "status": "completed"}]"#,
        ]);
        let small = ScriptedLlm::new(vec![NOT_EXTERNAL]);
        let mut d = deps(primary, small, dir.path());
        d.config.max_agent_iterations = 12;
        let mut agent_loop = AgentLoop::new(d);

        let outcome = agent_loop.run(&incident(), &[app_log()], "x").await;
        assert!(outcome
            .events
            .iter()
            .any(|e| e.event_type == EventType::PlanUpdated));
        // The replanned step was renumbered after the failed ones.
        assert!(outcome
            .events
            .iter()
            .any(|e| e.event_type == EventType::PlanCreated
                && e.data.get("is_replan") == Some(&json!(true))));
    }

    #[tokio::test]
    async fn successful_run_stores_memory() {
        let dir = tempfile::tempdir().unwrap();
        let memory_store = Arc::new(InMemoryMemoryStore::new());
        let primary = ScriptedLlm::new(vec![
            r#"[{"step_number": 1, "description": "Fix it"}]"#,
            r#"[{"tool": "write_file", "path": "src/fix.ts", "content": "patched"}]"#,
        ]);
        let small = ScriptedLlm::new(vec![NOT_EXTERNAL]);
        let mut d = deps(primary, small, dir.path());
        d.memory = Arc::new(FailsafeMemory::new(memory_store.clone()));
        let mut agent_loop = AgentLoop::new(d);

        let outcome = agent_loop.run(&incident(), &[app_log()], "null deref").await;
        assert_eq!(outcome.status, RunStatus::Success);

        use pipeline::memory::MemoryStore;
        let ctx = memory_store.retrieve_context(&outcome.fingerprint).await.unwrap();
        assert_eq!(ctx.known_fixes.len(), 1);
        assert!(ctx.known_fixes[0].description.starts_with("Fix for:"));
    }

    /// Slow LLM for exercising the per-step timeout tier.
    struct SlowLlm {
        delay: std::time::Duration,
    }

    #[async_trait]
    impl CompletionClient for SlowLlm {
        async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
            if prompt.contains("planning assistant") {
                return Ok(r#"[{"step_number": 1, "description": "Only step"}]"#.into());
            }
            tokio::time::sleep(self.delay).await;
            Ok(r#"[{"tool": "list_files"}]"#.into())
        }
    }

    #[tokio::test]
    async fn step_timeout_is_retried_then_failed() {
        let dir = tempfile::tempdir().unwrap();
        let primary = SlowLlm {
            delay: std::time::Duration::from_millis(200),
        };
        let small = ScriptedLlm::new(vec![NOT_EXTERNAL]);
        let mut d = AgentLoopDeps {
            llm: Arc::new(primary),
            small_llm: Arc::new(small),
            repo: None,
            memory: Arc::new(FailsafeMemory::new(Arc::new(InMemoryMemoryStore::new()))),
            knowledge: Arc::new(KnowledgeRetriever::new(Arc::new(HashEmbedder::new()))),
            artifacts: None,
            config: EngineConfig::default(),
        };
        d.config.scratchpad_dir = dir.path().to_string_lossy().into_owned();
        d.config.agent_step_timeout = std::time::Duration::from_millis(20);
        d.config.max_retries_per_step = 3;
        d.config.max_agent_iterations = 8;
        let mut agent_loop = AgentLoop::new(d);

        let outcome = agent_loop.run(&incident(), &[app_log()], "x").await;
        // Timeouts are retryable: 3 retries, then the step fails.
        assert_eq!(outcome.status, RunStatus::Error);
        let retry_events = outcome
            .events
            .iter()
            .filter(|e| {
                e.event_type == EventType::Error
                    && e.data["message"].as_str().unwrap_or("").starts_with("Retrying")
            })
            .count();
        assert_eq!(retry_events, 3);
        assert!(outcome
            .events
            .iter()
            .any(|e| e.event_type == EventType::PlanStepFailed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_loops_stay_isolated() {
        // Two loops on distinct incidents never cross-write workspaces or
        // event streams.
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let build = |dir: &std::path::Path, file: &'static str| {
            let primary = ScriptedLlm::new(vec![
                r#"[{"step_number": 1, "description": "Fix it"}]"#,
                // One write per incident, to a distinct path.
                match file {
                    "a" => r#"[{"tool": "write_file", "path": "src/a_only.ts", "content": "A"}]"#,
                    _ => r#"[{"tool": "write_file", "path": "src/b_only.ts", "content": "B"}]"#,
                },
            ]);
            let small = ScriptedLlm::new(vec![NOT_EXTERNAL]);
            AgentLoop::new(deps(primary, small, dir))
        };
        let mut loop_a = build(dir_a.path(), "a");
        let mut loop_b = build(dir_b.path(), "b");

        let mut incident_a = incident();
        incident_a.id = 100;
        let mut incident_b = incident();
        incident_b.id = 200;
        let logs_a = vec![app_log()];
        let logs_b = vec![app_log()];

        let (outcome_a, outcome_b) = tokio::join!(
            loop_a.run(&incident_a, &logs_a, "cause a"),
            loop_b.run(&incident_b, &logs_b, "cause b"),
        );

        assert_eq!(outcome_a.status, RunStatus::Success);
        assert_eq!(outcome_b.status, RunStatus::Success);
        assert!(outcome_a.fixes.contains_key("src/a_only.ts"));
        assert!(!outcome_a.fixes.contains_key("src/b_only.ts"));
        assert!(outcome_b.fixes.contains_key("src/b_only.ts"));
        assert!(!outcome_b.fixes.contains_key("src/a_only.ts"));
        assert!(outcome_a.events.iter().all(|e| e.incident_id == 100));
        assert!(outcome_b.events.iter().all(|e| e.incident_id == 200));
    }

    #[test]
    fn error_classification_matches_policy() {
        assert_eq!(
            classify_step_error(None, "connection reset by peer"),
            StepErrorClass::Retryable
        );
        assert_eq!(
            classify_step_error(None, "HTTP 503 from provider"),
            StepErrorClass::Retryable
        );
        assert_eq!(
            classify_step_error(Some(ErrorType::Timeout), "anything"),
            StepErrorClass::Retryable
        );
        assert_eq!(
            classify_step_error(None, "fatal: cannot proceed without schema"),
            StepErrorClass::Critical
        );
        assert_eq!(
            classify_step_error(None, "syntax error near line 4"),
            StepErrorClass::NonRetryable
        );
    }
}
