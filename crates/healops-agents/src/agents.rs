//! Participating-agent records: a small state machine per agent plus a
//! bounded history of completed tasks.
//!
//! States: `available` ⇄ `working`; `idle` entered only by the inactivity
//! timer; `disabled` is terminal until re-enabled externally. Updates are
//! scoped to a single agent's record, so one agent's transition can never
//! clobber another's claim.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on retained completed-task entries per agent.
const MAX_COMPLETED_TASKS: usize = 50;

/// Agent availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Available,
    Working,
    Idle,
    Disabled,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Available => "available",
            Self::Working => "working",
            Self::Idle => "idle",
            Self::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

/// One completed task in the history ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTask {
    pub description: String,
    pub incident_id: i64,
    pub succeeded: bool,
    pub finished_at: DateTime<Utc>,
}

/// Error for illegal agent-state transitions.
#[derive(Debug, thiserror::Error)]
#[error("illegal agent transition: {from} → {to}")]
pub struct IllegalAgentTransition {
    pub from: AgentState,
    pub to: AgentState,
}

/// One agent's record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub role: String,
    pub state: AgentState,
    pub current_task: Option<String>,
    completed_tasks: VecDeque<CompletedTask>,
    pub last_active_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            state: AgentState::Available,
            current_task: None,
            completed_tasks: VecDeque::new(),
            last_active_at: Utc::now(),
        }
    }

    /// available → working, recording the claimed task.
    pub fn start_task(&mut self, task: &str) -> Result<(), IllegalAgentTransition> {
        match self.state {
            AgentState::Available | AgentState::Idle => {
                self.state = AgentState::Working;
                self.current_task = Some(task.to_string());
                self.last_active_at = Utc::now();
                Ok(())
            }
            from => Err(IllegalAgentTransition {
                from,
                to: AgentState::Working,
            }),
        }
    }

    /// working → available on success or failure; the finished task joins
    /// the bounded history.
    pub fn finish_task(
        &mut self,
        incident_id: i64,
        succeeded: bool,
    ) -> Result<(), IllegalAgentTransition> {
        if self.state != AgentState::Working {
            return Err(IllegalAgentTransition {
                from: self.state,
                to: AgentState::Available,
            });
        }
        let description = self.current_task.take().unwrap_or_default();
        self.completed_tasks.push_back(CompletedTask {
            description,
            incident_id,
            succeeded,
            finished_at: Utc::now(),
        });
        while self.completed_tasks.len() > MAX_COMPLETED_TASKS {
            self.completed_tasks.pop_front();
        }
        self.state = AgentState::Available;
        self.last_active_at = Utc::now();
        Ok(())
    }

    /// Entered only by the inactivity timer.
    pub fn mark_idle(&mut self) {
        if self.state == AgentState::Available {
            self.state = AgentState::Idle;
        }
    }

    /// Terminal until re-enabled externally.
    pub fn disable(&mut self) {
        self.state = AgentState::Disabled;
        self.current_task = None;
    }

    pub fn enable(&mut self) {
        if self.state == AgentState::Disabled {
            self.state = AgentState::Available;
        }
    }

    pub fn completed_tasks(&self) -> impl Iterator<Item = &CompletedTask> {
        self.completed_tasks.iter()
    }

    pub fn completed_count(&self) -> usize {
        self.completed_tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_lifecycle_transitions() {
        let mut agent = AgentRecord::new("fixer", "code_fixer");
        assert_eq!(agent.state, AgentState::Available);

        agent.start_task("resolve incident 5").unwrap();
        assert_eq!(agent.state, AgentState::Working);
        assert_eq!(agent.current_task.as_deref(), Some("resolve incident 5"));
        // A working agent cannot start another task.
        assert!(agent.start_task("another").is_err());

        agent.finish_task(5, true).unwrap();
        assert_eq!(agent.state, AgentState::Available);
        assert!(agent.current_task.is_none());
        assert_eq!(agent.completed_count(), 1);
    }

    #[test]
    fn disabled_is_terminal_until_enabled() {
        let mut agent = AgentRecord::new("fixer", "code_fixer");
        agent.disable();
        assert!(agent.start_task("x").is_err());
        agent.enable();
        assert!(agent.start_task("x").is_ok());
    }

    #[test]
    fn idle_only_from_available_and_can_work() {
        let mut agent = AgentRecord::new("fixer", "code_fixer");
        agent.mark_idle();
        assert_eq!(agent.state, AgentState::Idle);
        agent.start_task("wake up").unwrap();
        assert_eq!(agent.state, AgentState::Working);
        // Working agents never go idle.
        agent.mark_idle();
        assert_eq!(agent.state, AgentState::Working);
    }

    #[test]
    fn history_is_a_bounded_ring() {
        let mut agent = AgentRecord::new("fixer", "code_fixer");
        for i in 0..60 {
            agent.start_task(&format!("task {i}")).unwrap();
            agent.finish_task(i, i % 2 == 0).unwrap();
        }
        assert_eq!(agent.completed_count(), 50);
        // Oldest entries were evicted.
        let first = agent.completed_tasks().next().unwrap();
        assert_eq!(first.description, "task 10");
    }

    #[test]
    fn finish_requires_working() {
        let mut agent = AgentRecord::new("fixer", "code_fixer");
        assert!(agent.finish_task(1, true).is_err());
    }
}
