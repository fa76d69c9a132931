//! Scratchpad: the externalized, human-readable mirror of a workspace.
//!
//! Two documents per incident: `scratchpad_{id}.md` (plan with progress)
//! and `notes_{id}.txt` (append-only notes). Backed either by a local
//! directory or, through the `ScratchpadBackend` trait, by a repo path
//! under `.healops/`. Kept eventually consistent with the workspace; all
//! failures here are logged and swallowed; the scratchpad is an aid, not
//! a dependency.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::planner::StepStatus;
use crate::workspace::Workspace;

/// Storage behind a scratchpad. The local filesystem impl lives here; a
/// repo-hosted impl (writing under `.healops/`) lives with the repo adapter.
#[async_trait]
pub trait ScratchpadBackend: Send + Sync {
    async fn read(&self, filename: &str) -> Option<String>;
    async fn write(&self, filename: &str, content: &str) -> anyhow::Result<()>;
    async fn delete(&self, filename: &str) -> anyhow::Result<()>;
}

/// Local-directory backend rooted at `SCRATCHPAD_DIR`.
pub struct LocalScratchpadBackend {
    dir: PathBuf,
}

impl LocalScratchpadBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ScratchpadBackend for LocalScratchpadBackend {
    async fn read(&self, filename: &str) -> Option<String> {
        tokio::fs::read_to_string(self.dir.join(filename)).await.ok()
    }

    async fn write(&self, filename: &str, content: &str) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(filename), content).await?;
        Ok(())
    }

    async fn delete(&self, filename: &str) -> anyhow::Result<()> {
        let path = self.dir.join(filename);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

/// Per-incident scratchpad over a backend.
pub struct Scratchpad {
    incident_id: i64,
    backend: Box<dyn ScratchpadBackend>,
}

impl Scratchpad {
    pub fn new(incident_id: i64, backend: Box<dyn ScratchpadBackend>) -> Self {
        Self {
            incident_id,
            backend,
        }
    }

    /// Local-directory scratchpad using the configured directory.
    pub fn local(incident_id: i64, dir: impl Into<PathBuf>) -> Self {
        Self::new(incident_id, Box::new(LocalScratchpadBackend::new(dir)))
    }

    pub fn scratchpad_filename(&self) -> String {
        format!("scratchpad_{}.md", self.incident_id)
    }

    pub fn notes_filename(&self) -> String {
        format!("notes_{}.txt", self.incident_id)
    }

    /// Write the initial plan document and an empty notes file.
    pub async fn initialize(&self, todo_md: &str) {
        if let Err(e) = self.backend.write(&self.scratchpad_filename(), todo_md).await {
            warn!(incident_id = self.incident_id, error = %e, "failed to write scratchpad");
        }
        let header = format!("# Notes for Incident #{}\n\n", self.incident_id);
        if let Err(e) = self.backend.write(&self.notes_filename(), &header).await {
            warn!(incident_id = self.incident_id, error = %e, "failed to write notes file");
        }
    }

    /// Append one timestamped note line.
    pub async fn add_note(&self, note: &str, category: &str) {
        let current = self.backend.read(&self.notes_filename()).await.unwrap_or_default();
        let line = format!(
            "[{}] [{}] {note}\n",
            Utc::now().to_rfc3339(),
            category.to_uppercase()
        );
        if let Err(e) = self
            .backend
            .write(&self.notes_filename(), &format!("{current}{line}"))
            .await
        {
            warn!(incident_id = self.incident_id, error = %e, "failed to append note");
        }
    }

    /// Mirror the workspace: rewrite the plan document from the workspace's
    /// plan and append any workspace notes not yet externalized.
    pub async fn sync_from_workspace(&self, workspace: &Workspace) {
        if let Some(plan) = workspace.plan() {
            let mut lines = vec![
                "# Fix Plan".to_string(),
                String::new(),
                format!("Incident ID: {}", self.incident_id),
                String::new(),
            ];
            let completed = plan.iter().filter(|s| s.status == StepStatus::Completed).count();
            lines.push(format!("Progress: {completed}/{} steps completed", plan.len()));
            lines.push(String::new());
            lines.push("## Steps".to_string());
            lines.push(String::new());
            for step in plan {
                lines.push(format!(
                    "{} **Step {}**: {}",
                    step.status.icon(),
                    step.step_number,
                    step.description
                ));
                if let Some(result) = &step.result {
                    let preview: String = result.chars().take(200).collect();
                    lines.push(format!("   Result: {preview}"));
                }
                lines.push(String::new());
            }
            if let Err(e) = self
                .backend
                .write(&self.scratchpad_filename(), &lines.join("\n"))
                .await
            {
                warn!(incident_id = self.incident_id, error = %e, "failed to sync scratchpad");
            }
        }

        for note in workspace.notes() {
            self.add_note(&note.note, &note.category).await;
        }
    }

    pub async fn read_scratchpad(&self) -> Option<String> {
        self.backend.read(&self.scratchpad_filename()).await
    }

    pub async fn read_notes(&self) -> Option<String> {
        self.backend.read(&self.notes_filename()).await
    }

    /// Remove both files. Best-effort.
    pub async fn cleanup(&self) {
        for filename in [self.scratchpad_filename(), self.notes_filename()] {
            if let Err(e) = self.backend.delete(&filename).await {
                warn!(incident_id = self.incident_id, filename, error = %e, "scratchpad cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlanStep;

    #[tokio::test]
    async fn initialize_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let pad = Scratchpad::local(5, dir.path());
        pad.initialize("# Fix Plan\n\nIncident ID: 5\n").await;

        let content = pad.read_scratchpad().await.unwrap();
        assert!(content.contains("Incident ID: 5"));
        let notes = pad.read_notes().await.unwrap();
        assert!(notes.contains("# Notes for Incident #5"));
    }

    #[tokio::test]
    async fn notes_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let pad = Scratchpad::local(5, dir.path());
        pad.initialize("plan").await;
        pad.add_note("first observation", "observation").await;
        pad.add_note("second: fixed it", "general").await;

        let notes = pad.read_notes().await.unwrap();
        let first = notes.find("first observation").unwrap();
        let second = notes.find("second: fixed it").unwrap();
        assert!(first < second);
        assert!(notes.contains("[OBSERVATION]"));
    }

    #[tokio::test]
    async fn sync_mirrors_workspace_plan_and_notes() {
        let dir = tempfile::tempdir().unwrap();
        let pad = Scratchpad::local(9, dir.path());
        pad.initialize("initial").await;

        let mut ws = Workspace::new(9);
        let mut step = PlanStep::new(1, "read files");
        step.status = StepStatus::Completed;
        step.result = Some("read 3 files".into());
        ws.set_plan(vec![step, PlanStep::new(2, "fix")]);
        ws.add_note("found the bad null check", "discovery");

        pad.sync_from_workspace(&ws).await;

        let content = pad.read_scratchpad().await.unwrap();
        assert!(content.contains("Progress: 1/2 steps completed"));
        assert!(content.contains("[x] **Step 1**: read files"));
        assert!(content.contains("[ ] **Step 2**: fix"));
        let notes = pad.read_notes().await.unwrap();
        assert!(notes.contains("found the bad null check"));
    }

    #[tokio::test]
    async fn cleanup_removes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let pad = Scratchpad::local(5, dir.path());
        pad.initialize("plan").await;
        pad.cleanup().await;
        assert!(pad.read_scratchpad().await.is_none());
        assert!(pad.read_notes().await.is_none());
        // Cleanup of already-missing files stays silent.
        pad.cleanup().await;
    }
}
