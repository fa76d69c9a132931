//! Plan step model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Marker used in the scratchpad markdown rendering.
    pub fn icon(self) -> &'static str {
        match self {
            Self::Pending => "[ ]",
            Self::InProgress => "[~]",
            Self::Completed => "[x]",
            Self::Failed => "[!]",
            Self::Skipped => "[-]",
        }
    }

    /// Whether the step counts toward plan completion.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// One numbered unit of work in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_number: u32,
    pub description: String,
    #[serde(default)]
    pub files_to_read: Vec<String>,
    #[serde(default)]
    pub expected_output: String,
    pub status: StepStatus,
    pub result: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PlanStep {
    pub fn new(step_number: u32, description: impl Into<String>) -> Self {
        Self {
            step_number,
            description: description.into(),
            files_to_read: Vec::new(),
            expected_output: String::new(),
            status: StepStatus::Pending,
            result: None,
            errors: Vec::new(),
            retry_count: 0,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files_to_read = files;
        self
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = expected.into();
        self
    }
}
