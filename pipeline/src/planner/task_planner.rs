//! The planner proper: plan creation, step status bookkeeping, and
//! completed-step-preserving replans.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::parse::parse_plan_steps;
use super::step::{PlanStep, StepStatus};
use super::CompletionClient;
use crate::config::u32_from_env;
use crate::errors::{PipelineError, PipelineResult};

/// Snapshot of a superseded plan, kept across replans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRevision {
    pub version: u32,
    pub plan: Vec<PlanStep>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub current_step_index: usize,
}

/// Progress summary over the current plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanProgress {
    pub total_steps: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub completion_percentage: f64,
}

/// Breaks a root cause into ordered, executable steps and tracks their
/// lifecycle. The planning policy is enforced by the prompt: read all
/// affected files first, trace dependencies second, analyze third, and
/// only then generate fixes.
pub struct TaskPlanner {
    incident_id: i64,
    plan: Vec<PlanStep>,
    current_step_index: usize,
    plan_history: Vec<PlanRevision>,
    replan_count: u32,
    max_replans: u32,
}

impl TaskPlanner {
    pub fn new(incident_id: i64) -> Self {
        Self {
            incident_id,
            plan: Vec::new(),
            current_step_index: 0,
            plan_history: Vec::new(),
            replan_count: 0,
            max_replans: u32_from_env("MAX_REPLANS", 3),
        }
    }

    pub fn with_max_replans(mut self, max_replans: u32) -> Self {
        self.max_replans = max_replans;
        self
    }

    pub fn plan(&self) -> &[PlanStep] {
        &self.plan
    }

    pub fn replan_count(&self) -> u32 {
        self.replan_count
    }

    pub fn plan_history(&self) -> &[PlanRevision] {
        &self.plan_history
    }

    fn planning_prompt(
        root_cause: &str,
        affected_files: &[String],
        knowledge_context: Option<&str>,
    ) -> String {
        let files = if affected_files.is_empty() {
            "None".to_string()
        } else {
            affected_files.join(", ")
        };
        let knowledge = knowledge_context
            .map(|k| format!("Relevant Knowledge: {k}\n\n"))
            .unwrap_or_default();
        format!(
            "You are a planning assistant. Break down the following incident fix into ordered steps.\n\n\
             Root Cause: {root_cause}\n\
             Affected Files: {files}\n\n\
             {knowledge}\
             PLANNING REQUIREMENTS:\n\
             1. Step 1 MUST read ALL affected files completely.\n\
             2. Step 2 MUST trace dependencies and read related files.\n\
             3. Step 3 MUST analyze the root cause in light of the full context.\n\
             4. Only steps 4 and later may generate and validate fixes.\n\
             5. Steps must be specific and actionable with a clear completion criterion.\n\n\
             Format as a JSON array of objects with keys: step_number, description, \
             files_to_read (array of strings), expected_output.\n\
             Return ONLY the JSON array, no other text."
        )
    }

    fn replan_prompt(
        &self,
        reason: &str,
        root_cause: &str,
        affected_files: &[String],
        knowledge_context: Option<&str>,
    ) -> String {
        let completed: Vec<String> = self
            .plan
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| format!("Step {}: {}", s.step_number, s.description))
            .collect();
        let failed: Vec<String> = self
            .plan
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| {
                let errs = s.errors.iter().take(2).cloned().collect::<Vec<_>>().join("; ");
                format!("Step {}: {} (errors: {errs})", s.step_number, s.description)
            })
            .collect();
        let knowledge = knowledge_context
            .map(|k| format!("Relevant Knowledge: {k}\n\n"))
            .unwrap_or_default();
        format!(
            "Previous plan failed or needs adjustment.\n\n\
             Reason for replanning: {reason}\n\
             Original Root Cause: {root_cause}\n\
             Affected Files: {}\n\n\
             Completed Steps ({}):\n{}\n\n\
             Failed Steps ({}):\n{}\n\n\
             {knowledge}\
             Generate a NEW plan that:\n\
             1. Preserves completed steps (do not redo them).\n\
             2. Addresses the failures with different approaches.\n\
             3. Continues from where we left off.\n\n\
             Format as a JSON array (same format as before). Return ONLY the JSON array.",
            affected_files.join(", "),
            completed.len(),
            if completed.is_empty() { "None".into() } else { completed.join("\n") },
            failed.len(),
            if failed.is_empty() { "None".into() } else { failed.join("\n") },
        )
    }

    /// Generate a plan with the LLM; fall back to the fixed 5-step plan on
    /// any parse or transport failure.
    pub async fn create_plan(
        &mut self,
        root_cause: &str,
        affected_files: &[String],
        llm: &dyn CompletionClient,
        knowledge_context: Option<&str>,
    ) -> PipelineResult<&[PlanStep]> {
        let prompt = Self::planning_prompt(root_cause, affected_files, knowledge_context);
        let plan = match llm.complete(&prompt).await {
            Ok(reply) => match parse_plan_steps(&reply) {
                Ok(raw) if !raw.is_empty() => Self::materialize(raw),
                Ok(_) | Err(_) => {
                    warn!(
                        incident_id = self.incident_id,
                        "plan reply unusable, using fallback plan"
                    );
                    Self::fallback_plan(affected_files, root_cause)
                }
            },
            Err(e) => {
                warn!(
                    incident_id = self.incident_id,
                    error = %e,
                    "plan generation failed, using fallback plan"
                );
                Self::fallback_plan(affected_files, root_cause)
            }
        };
        info!(
            incident_id = self.incident_id,
            steps = plan.len(),
            "plan created"
        );
        self.plan = plan;
        self.current_step_index = 0;
        Ok(&self.plan)
    }

    fn materialize(raw: Vec<super::parse::RawPlanStep>) -> Vec<PlanStep> {
        let mut plan = Vec::with_capacity(raw.len());
        for (i, r) in raw.into_iter().enumerate() {
            let step_number = r.step_number.unwrap_or(i as u32 + 1);
            plan.push(
                PlanStep::new(step_number, r.description)
                    .with_files(r.files_to_read)
                    .with_expected_output(r.expected_output),
            );
        }
        // Renumber if the model emitted duplicates or gaps out of order.
        let mut seen = std::collections::HashSet::new();
        let strictly_increasing = plan
            .windows(2)
            .all(|w| w[0].step_number < w[1].step_number)
            && plan.iter().all(|s| seen.insert(s.step_number));
        if !strictly_increasing {
            for (i, step) in plan.iter_mut().enumerate() {
                step.step_number = i as u32 + 1;
            }
        }
        plan
    }

    /// Deterministic plan used when the model cannot produce one:
    /// read → trace → analyze → fix → validate.
    pub fn fallback_plan(affected_files: &[String], root_cause: &str) -> Vec<PlanStep> {
        let listed = affected_files
            .iter()
            .take(5)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        let cause_preview: String = root_cause.chars().take(150).collect();
        vec![
            PlanStep::new(
                1,
                format!(
                    "Read and understand ALL affected files completely: {}",
                    if listed.is_empty() { "None" } else { &listed }
                ),
            )
            .with_files(affected_files.iter().take(10).cloned().collect())
            .with_expected_output("Complete understanding of all affected file contents"),
            PlanStep::new(
                2,
                "Trace dependencies: find and read all files that import or are imported by the affected files",
            )
            .with_expected_output("Complete dependency graph and symbol definitions"),
            PlanStep::new(
                3,
                format!("Analyze root cause in context of the complete codebase: {cause_preview}"),
            )
            .with_expected_output("Root cause analysis grounded in the code read so far"),
            PlanStep::new(
                4,
                "Generate code fix based on complete understanding, using incremental edits",
            )
            .with_files(affected_files.iter().take(5).cloned().collect())
            .with_expected_output("Code fix addressing the root cause"),
            PlanStep::new(
                5,
                "Validate fix: check syntax and verify impact on dependencies",
            )
            .with_expected_output("Validation results confirming the fix"),
        ]
    }

    /// The step the loop should execute next, if any.
    pub fn get_current_step(&self) -> Option<&PlanStep> {
        self.plan.get(self.current_step_index)
    }

    pub fn get_current_step_mut(&mut self) -> Option<&mut PlanStep> {
        self.plan.get_mut(self.current_step_index)
    }

    pub fn mark_step_in_progress(&mut self, step_number: u32) {
        if let Some(step) = self.step_mut(step_number) {
            step.status = StepStatus::InProgress;
            step.started_at = Some(Utc::now());
        }
    }

    pub fn mark_step_completed(&mut self, step_number: u32, result: Option<&str>) {
        if let Some(step) = self.step_mut(step_number) {
            step.status = StepStatus::Completed;
            step.result = result.map(|r| r.chars().take(500).collect());
            step.completed_at = Some(Utc::now());
        }
    }

    pub fn mark_step_failed(&mut self, step_number: u32, error: &str) {
        if let Some(step) = self.step_mut(step_number) {
            step.status = StepStatus::Failed;
            step.errors.push(error.to_string());
        }
    }

    pub fn increment_retry(&mut self, step_number: u32) -> u32 {
        match self.step_mut(step_number) {
            Some(step) => {
                step.retry_count += 1;
                step.retry_count
            }
            None => 0,
        }
    }

    pub fn advance_to_next_step(&mut self) {
        self.current_step_index += 1;
    }

    /// All steps completed or skipped.
    pub fn is_complete(&self) -> bool {
        !self.plan.is_empty() && self.plan.iter().all(|s| s.status.is_done())
    }

    pub fn get_progress(&self) -> PlanProgress {
        let total = self.plan.len();
        let count = |status: StepStatus| self.plan.iter().filter(|s| s.status == status).count();
        let completed = count(StepStatus::Completed);
        PlanProgress {
            total_steps: total,
            completed,
            failed: count(StepStatus::Failed),
            in_progress: count(StepStatus::InProgress),
            pending: count(StepStatus::Pending),
            completion_percentage: if total > 0 {
                completed as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// Render the plan as scratchpad markdown.
    pub fn to_todo_md(&self) -> String {
        let mut lines = vec![
            "# Fix Plan".to_string(),
            String::new(),
            format!("Incident ID: {}", self.incident_id),
            String::new(),
        ];
        let progress = self.get_progress();
        lines.push(format!(
            "Progress: {}/{} steps completed ({:.1}%)",
            progress.completed, progress.total_steps, progress.completion_percentage
        ));
        lines.push(String::new());
        lines.push("## Steps".to_string());
        lines.push(String::new());
        for step in &self.plan {
            lines.push(format!(
                "{} **Step {}**: {}",
                step.status.icon(),
                step.step_number,
                step.description
            ));
            if !step.files_to_read.is_empty() {
                lines.push(format!("   Files: {}", step.files_to_read.join(", ")));
            }
            if let Some(result) = &step.result {
                let preview: String = result.chars().take(200).collect();
                lines.push(format!("   Result: {preview}"));
            }
            for error in step.errors.iter().take(3) {
                let preview: String = error.chars().take(150).collect();
                lines.push(format!("   Error: {preview}"));
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }

    /// Regenerate the plan, preserving completed steps.
    ///
    /// Completed steps keep their numbers, statuses and results; new steps
    /// that do not duplicate a completed description are appended with
    /// numbers continuing from the highest used, and the cursor resets to
    /// the first pending step.
    pub async fn replan(
        &mut self,
        reason: &str,
        root_cause: &str,
        affected_files: &[String],
        llm: &dyn CompletionClient,
        knowledge_context: Option<&str>,
    ) -> PipelineResult<&[PlanStep]> {
        if self.replan_count >= self.max_replans {
            return Err(PipelineError::MaxReplansReached(self.max_replans));
        }

        self.plan_history.push(PlanRevision {
            version: self.plan_history.len() as u32 + 1,
            plan: self.plan.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
            current_step_index: self.current_step_index,
        });

        let prompt = self.replan_prompt(reason, root_cause, affected_files, knowledge_context);
        let reply = llm
            .complete(&prompt)
            .await
            .map_err(|e| PipelineError::Plan(format!("replan LLM call failed: {e}")))?;
        let new_steps = Self::materialize(parse_plan_steps(&reply)?);

        self.merge_plans(new_steps);
        self.replan_count += 1;
        info!(
            incident_id = self.incident_id,
            replan_count = self.replan_count,
            reason,
            steps = self.plan.len(),
            "replanned"
        );
        Ok(&self.plan)
    }

    fn merge_plans(&mut self, new_plan: Vec<PlanStep>) {
        let completed: Vec<PlanStep> = self
            .plan
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .cloned()
            .collect();

        let mut merged = completed.clone();
        let mut next_number = merged
            .iter()
            .map(|s| s.step_number)
            .max()
            .map(|n| n + 1)
            .unwrap_or(1);

        for mut step in new_plan {
            let duplicate = completed.iter().any(|c| {
                c.description.to_lowercase() == step.description.to_lowercase()
            });
            if duplicate {
                continue;
            }
            step.step_number = next_number;
            step.status = StepStatus::Pending;
            next_number += 1;
            merged.push(step);
        }

        self.plan = merged;
        self.current_step_index = self
            .plan
            .iter()
            .position(|s| s.status == StepStatus::Pending)
            .unwrap_or(self.plan.len());
    }

    /// Summarize completed steps for context compaction.
    pub fn summarize_completed_steps(&self) -> String {
        let completed: Vec<&PlanStep> = self
            .plan
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .collect();
        if completed.is_empty() {
            return String::new();
        }
        let mut summary = format!("Completed {}/{} steps:\n", completed.len(), self.plan.len());
        for step in completed {
            summary.push_str(&format!("- Step {}: {}\n", step.step_number, step.description));
            if let Some(result) = &step.result {
                let preview: String = result.chars().take(100).collect();
                summary.push_str(&format!("  Result: {preview}\n"));
            }
        }
        summary
    }

    fn step_mut(&mut self, step_number: u32) -> Option<&mut PlanStep> {
        self.plan.iter_mut().find(|s| s.step_number == step_number)
    }
}
