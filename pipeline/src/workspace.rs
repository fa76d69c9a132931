//! In-memory working set owned by one agent loop.
//!
//! Tracks file contents, the current plan, and notes for the duration of a
//! run. File state is updated from the `files_written` declared by tool
//! outcomes; nothing here touches the repo host. Serialized to a
//! `WorkspaceRecord` when the run ends.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::planner::{PlanStep, StepStatus};

/// A categorized note captured during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceNote {
    pub note: String,
    pub category: String,
    pub timestamp: DateTime<Utc>,
}

/// Persisted snapshot of a workspace, one row per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub incident_id: i64,
    pub files: BTreeMap<String, String>,
    pub plan: Option<Vec<PlanStep>>,
    pub notes: Vec<WorkspaceNote>,
    pub saved_at: DateTime<Utc>,
}

/// The live working set.
#[derive(Debug, Clone)]
pub struct Workspace {
    incident_id: i64,
    files: BTreeMap<String, String>,
    plan: Option<Vec<PlanStep>>,
    notes: Vec<WorkspaceNote>,
}

impl Workspace {
    pub fn new(incident_id: i64) -> Self {
        Self {
            incident_id,
            files: BTreeMap::new(),
            plan: None,
            notes: Vec::new(),
        }
    }

    pub fn incident_id(&self) -> i64 {
        self.incident_id
    }

    pub fn get_file(&self, file_path: &str) -> Option<&str> {
        self.files.get(file_path).map(String::as_str)
    }

    pub fn set_file(&mut self, file_path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(file_path.into(), content.into());
    }

    /// Merge files declared as written by a tool batch into the workspace.
    pub fn apply_files_written(&mut self, files: &BTreeMap<String, String>) {
        for (path, content) in files {
            self.files.insert(path.clone(), content.clone());
        }
    }

    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn set_plan(&mut self, plan: Vec<PlanStep>) {
        self.plan = Some(plan);
    }

    pub fn plan(&self) -> Option<&[PlanStep]> {
        self.plan.as_deref()
    }

    /// Update the status (and optionally result) of one plan step mirror.
    pub fn update_todo_step(&mut self, step_number: u32, status: StepStatus, result: Option<&str>) {
        let Some(plan) = self.plan.as_mut() else {
            return;
        };
        if let Some(step) = plan.iter_mut().find(|s| s.step_number == step_number) {
            step.status = status;
            if let Some(result) = result {
                step.result = Some(result.to_string());
            }
        }
    }

    pub fn add_note(&mut self, note: impl Into<String>, category: impl Into<String>) {
        self.notes.push(WorkspaceNote {
            note: note.into(),
            category: category.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn notes(&self) -> &[WorkspaceNote] {
        &self.notes
    }

    /// Textual summary for LLM context: file list (first 10), plan progress,
    /// last 5 notes.
    pub fn get_workspace_state(&self) -> String {
        let mut lines = vec![
            format!("Workspace State (Incident #{}):", self.incident_id),
            String::new(),
        ];

        if !self.files.is_empty() {
            lines.push(format!("Files in workspace ({}):", self.files.len()));
            for path in self.files.keys().take(10) {
                lines.push(format!("  - {path}"));
            }
            if self.files.len() > 10 {
                lines.push(format!("  ... and {} more files", self.files.len() - 10));
            }
            lines.push(String::new());
        }

        if let Some(plan) = &self.plan {
            let completed = plan.iter().filter(|s| s.status == StepStatus::Completed).count();
            lines.push(format!(
                "Plan Progress: {completed}/{} steps completed",
                plan.len()
            ));
            lines.push(String::new());
        }

        if !self.notes.is_empty() {
            lines.push(format!("Notes ({}):", self.notes.len()));
            let start = self.notes.len().saturating_sub(5);
            for note in &self.notes[start..] {
                let preview: String = note.note.chars().take(100).collect();
                lines.push(format!("  [{}] {preview}", note.category));
            }
            lines.push(String::new());
        }

        lines.join("\n")
    }

    /// Snapshot for persistence.
    pub fn to_record(&self) -> WorkspaceRecord {
        WorkspaceRecord {
            incident_id: self.incident_id,
            files: self.files.clone(),
            plan: self.plan.clone(),
            notes: self.notes.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Rebuild a workspace from a persisted record.
    pub fn from_record(record: WorkspaceRecord) -> Self {
        Self {
            incident_id: record.incident_id,
            files: record.files,
            plan: record.plan,
            notes: record.notes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlanStep;

    #[test]
    fn files_merge_from_tool_outcomes() {
        let mut ws = Workspace::new(1);
        ws.set_file("src/a.ts", "old");
        let mut written = BTreeMap::new();
        written.insert("src/a.ts".to_string(), "new".to_string());
        written.insert("src/b.ts".to_string(), "fresh".to_string());
        ws.apply_files_written(&written);
        assert_eq!(ws.get_file("src/a.ts"), Some("new"));
        assert_eq!(ws.get_file("src/b.ts"), Some("fresh"));
        assert_eq!(ws.file_count(), 2);
    }

    #[test]
    fn todo_step_updates_mirror_plan() {
        let mut ws = Workspace::new(1);
        ws.set_plan(vec![PlanStep::new(1, "read"), PlanStep::new(2, "fix")]);
        ws.update_todo_step(2, StepStatus::Completed, Some("patched"));
        let plan = ws.plan().unwrap();
        assert_eq!(plan[1].status, StepStatus::Completed);
        assert_eq!(plan[1].result.as_deref(), Some("patched"));
        // Unknown step numbers are ignored.
        ws.update_todo_step(9, StepStatus::Failed, None);
    }

    #[test]
    fn state_summary_caps_files_and_notes() {
        let mut ws = Workspace::new(7);
        for i in 0..15 {
            ws.set_file(format!("src/file{i:02}.ts"), "x");
        }
        for i in 0..8 {
            ws.add_note(format!("note {i}"), "observation");
        }
        ws.set_plan(vec![PlanStep::new(1, "read")]);
        let state = ws.get_workspace_state();
        assert!(state.contains("Workspace State (Incident #7):"));
        assert!(state.contains("Files in workspace (15):"));
        assert!(state.contains("... and 5 more files"));
        assert!(state.contains("Plan Progress: 0/1"));
        assert!(state.contains("note 7"));
        assert!(!state.contains("note 2"));
    }

    #[test]
    fn record_round_trip() {
        let mut ws = Workspace::new(3);
        ws.set_file("a.py", "print(1)");
        ws.add_note("started", "general");
        ws.set_plan(vec![PlanStep::new(1, "read")]);

        let record = ws.to_record();
        let json = serde_json::to_string(&record).unwrap();
        let parsed: WorkspaceRecord = serde_json::from_str(&json).unwrap();
        let restored = Workspace::from_record(parsed);

        assert_eq!(restored.incident_id(), 3);
        assert_eq!(restored.get_file("a.py"), Some("print(1)"));
        assert_eq!(restored.notes().len(), 1);
        assert_eq!(restored.plan().unwrap().len(), 1);
    }
}
