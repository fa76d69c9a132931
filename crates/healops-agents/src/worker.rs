//! Bus worker: consumes incident-topic tasks, claims resolutions through
//! the ledger, runs the agent loop, and settles the outcome.
//!
//! Exactly-once *effective* processing on top of at-least-once delivery:
//! a `resolve_incident` task is only acted on by the worker that wins the
//! QUEUED→IN_FLIGHT claim; losers drop the task silently.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use pipeline::bus::{IncidentTask, TaskEnvelope, TaskHandler};
use pipeline::incident::{Incident, LogEntry};
use pipeline::ledger::ResolutionRequests;
use pipeline::reducer::LogReducer;
use pipeline::storage::{IncidentStore, LogStore};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::adapters::{ChatHost, RepoHost, TicketHost};
use crate::agent_loop::{AgentLoop, AgentLoopDeps, RunStatus};
use crate::analysis::RootCauseAnalyzer;

/// Builds a fresh agent loop per job so runs stay isolated.
pub trait AgentLoopFactory: Send + Sync {
    fn build(&self) -> AgentLoop;
}

/// Default factory over shared dependencies.
pub struct SharedDepsFactory {
    pub build_deps: Box<dyn Fn() -> AgentLoopDeps + Send + Sync>,
}

impl AgentLoopFactory for SharedDepsFactory {
    fn build(&self) -> AgentLoop {
        AgentLoop::new((self.build_deps)())
    }
}

/// The consumer wired onto the `incidents` topic.
pub struct IncidentWorker {
    pub reducer: Arc<LogReducer>,
    pub requests: Arc<ResolutionRequests>,
    pub incidents: Arc<dyn IncidentStore>,
    pub logs: Arc<dyn LogStore>,
    pub analyzer: Arc<RootCauseAnalyzer>,
    pub loop_factory: Arc<dyn AgentLoopFactory>,
    pub repo: Option<Arc<dyn RepoHost>>,
    pub tickets: Option<Arc<dyn TicketHost>>,
    pub chat: Option<Arc<dyn ChatHost>>,
    pub chat_channel: Option<String>,
    /// Jobs currently in flight, for tests and graceful shutdown.
    pub active_jobs: Mutex<u32>,
}

#[async_trait]
impl TaskHandler for IncidentWorker {
    async fn handle(&self, envelope: TaskEnvelope) {
        let Some(task) = envelope.as_incident().cloned() else {
            warn!("non-incident task on incidents topic, dropping");
            return;
        };
        match task {
            IncidentTask::ProcessLogEntry { log_id } => {
                if let Err(e) = self.reducer.process_log_entry(log_id).await {
                    error!(log_id, error = %e, "log processing failed");
                }
            }
            IncidentTask::ResolveIncident {
                incident_id,
                requested_by_user_id,
            } => {
                self.handle_resolve(incident_id, requested_by_user_id).await;
            }
            IncidentTask::RcaCursorSlack { incident_id, user_id } => {
                self.handle_rca_notify(incident_id, user_id).await;
            }
        }
    }
}

impl IncidentWorker {
    async fn handle_resolve(&self, incident_id: i64, requested_by_user_id: i64) {
        // Claim first; a lost race means another worker owns this job.
        match self.requests.try_claim_incident_resolution(incident_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(incident_id, "claim lost, dropping duplicate resolve task");
                return;
            }
            Err(e) => {
                error!(incident_id, error = %e, "claim failed");
                return;
            }
        }
        *self.active_jobs.lock().await += 1;
        let result = self.run_resolution_job(incident_id, requested_by_user_id).await;
        *self.active_jobs.lock().await -= 1;

        match result {
            Ok(()) => {
                if let Err(e) = self
                    .requests
                    .mark_incident_resolution_completed(incident_id)
                    .await
                {
                    error!(incident_id, error = %e, "failed to mark resolution completed");
                }
            }
            Err(e) => {
                error!(incident_id, error = %e, "resolution job failed");
                if let Err(mark_err) = self
                    .requests
                    .mark_incident_resolution_failed(incident_id, &e.to_string())
                    .await
                {
                    error!(incident_id, error = %mark_err, "failed to mark resolution failed");
                }
            }
        }
    }

    async fn load_incident_and_logs(
        &self,
        incident_id: i64,
    ) -> anyhow::Result<(Incident, Vec<LogEntry>)> {
        let incident = self
            .incidents
            .get_incident(incident_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("incident {incident_id} not found"))?;
        let logs = self.logs.get_logs(&incident.log_ids).await?;
        Ok((incident, logs))
    }

    /// Status bookkeeping must never sink a run: a re-queued request for an
    /// incident whose status already moved (e.g. FAILED from a prior
    /// attempt) proceeds without the transition.
    async fn try_transition(
        &self,
        incident: &mut Incident,
        to: pipeline::incident::IncidentStatus,
    ) {
        match incident.set_status(to) {
            Ok(()) => {
                if let Err(e) = self.incidents.update_incident(incident).await {
                    warn!(incident_id = incident.id, error = %e, "status update failed");
                }
            }
            Err(e) => {
                warn!(incident_id = incident.id, error = %e, "skipping status transition");
            }
        }
    }

    async fn run_resolution_job(
        &self,
        incident_id: i64,
        _requested_by_user_id: i64,
    ) -> anyhow::Result<()> {
        let (mut incident, logs) = self.load_incident_and_logs(incident_id).await?;
        info!(incident_id, service = %incident.service_name, "starting resolution job");

        if incident.status == pipeline::incident::IncidentStatus::Open {
            self.try_transition(&mut incident, pipeline::incident::IncidentStatus::Investigating)
                .await;
        }

        // Root cause, reusing a prior analysis when present.
        let root_cause = match &incident.root_cause {
            Some(rc) => rc.clone(),
            None => match self.analyzer.analyze(&incident, &logs).await {
                Some(analysis) => {
                    incident.root_cause = Some(analysis.root_cause.clone());
                    if incident.action_taken.is_none() && !analysis.suggested_action.is_empty() {
                        incident.action_taken = Some(analysis.suggested_action.clone());
                    }
                    self.incidents.update_incident(&incident).await?;
                    analysis.root_cause
                }
                None => {
                    anyhow::bail!("root-cause analysis produced nothing");
                }
            },
        };

        self.try_transition(&mut incident, pipeline::incident::IncidentStatus::Healing)
            .await;

        let mut agent_loop = self.loop_factory.build();
        let outcome = agent_loop.run(&incident, &logs, &root_cause).await;
        info!(
            incident_id,
            status = ?outcome.status,
            iterations = outcome.iterations,
            fixes = outcome.fixes.len(),
            "agent loop finished"
        );

        match outcome.status {
            RunStatus::SkippedExternal => {
                // Not a failure: record why and complete.
                incident.code_fix_explanation = outcome.skip_explanation.clone();
                incident.resolved_at = Some(chrono::Utc::now());
                self.incidents.update_incident(&incident).await?;
                self.try_transition(&mut incident, pipeline::incident::IncidentStatus::Resolved)
                    .await;
                Ok(())
            }
            RunStatus::Success => {
                if !outcome.fixes.is_empty() {
                    self.publish_fix(&mut incident, &outcome.fixes).await;
                }
                incident.resolved_at = Some(chrono::Utc::now());
                self.incidents.update_incident(&incident).await?;
                self.try_transition(&mut incident, pipeline::incident::IncidentStatus::Resolved)
                    .await;
                self.notify_chat(&incident, "resolved, PR opened for review").await;
                Ok(())
            }
            RunStatus::Partial | RunStatus::Error => {
                incident.code_fix_explanation = Some(format!(
                    "Automated resolution did not complete \
                     ({}/{} plan steps done{}).",
                    outcome.plan_progress.completed,
                    outcome.plan_progress.total_steps,
                    outcome
                        .timeout_type
                        .map(|t| format!(", stopped by {t}"))
                        .unwrap_or_default(),
                ));
                self.incidents.update_incident(&incident).await?;
                self.try_transition(&mut incident, pipeline::incident::IncidentStatus::Failed)
                    .await;
                anyhow::bail!(
                    "agent loop ended with {:?} after {} iterations",
                    outcome.status,
                    outcome.iterations
                )
            }
        }
    }

    /// Open a PR with the workspace fixes and note it on the incident and
    /// its ticket. PR failures degrade to warnings: the fix itself lives
    /// in the workspace record either way.
    async fn publish_fix(&self, incident: &mut Incident, fixes: &BTreeMap<String, String>) {
        let Some(repo) = &self.repo else {
            return;
        };
        let Some(repo_name) = incident.repo_name.clone() else {
            warn!(incident_id = incident.id, "no repo configured, skipping PR");
            return;
        };
        let base_branch = match repo.get_repo_info(&repo_name).await {
            Ok(info) => info.default_branch,
            Err(e) => {
                warn!(incident_id = incident.id, error = %e, "repo info unavailable, using main");
                "main".to_string()
            }
        };
        let head_branch = format!("healops/incident-{}", incident.id);
        let body = format!(
            "Automated fix for incident #{}.\n\n**Root cause:** {}\n\n\
             Generated by the incident-resolution agent; review before merging.",
            incident.id,
            incident.root_cause.as_deref().unwrap_or("unknown"),
        );
        match repo
            .create_pr(
                &repo_name,
                &format!("fix: {}", incident.title),
                &body,
                &head_branch,
                &base_branch,
                fixes,
                true,
            )
            .await
        {
            Ok(pr) => {
                info!(incident_id = incident.id, pr = pr.number, "PR created");
                incident.pr_info = Some(pipeline::incident::PrInfo {
                    url: pr.url.clone(),
                    number: pr.number,
                    files_changed: fixes.keys().cloned().collect(),
                    original_contents: BTreeMap::new(),
                });
                incident.action_taken = Some(format!("Opened PR #{} ({})", pr.number, pr.url));

                // Ticket comment, when the reducer filed one.
                if let (Some(tickets), Some(issue_id)) = (
                    &self.tickets,
                    incident
                        .metadata
                        .get("linear_issue")
                        .and_then(|v| v.get("id"))
                        .and_then(|v| v.as_str()),
                ) {
                    let comment = format!("Automated fix proposed: {}", pr.url);
                    if let Err(e) = tickets.add_comment_to_issue(issue_id, &comment).await {
                        warn!(incident_id = incident.id, error = %e, "ticket comment failed");
                    }
                }
            }
            Err(e) => {
                warn!(incident_id = incident.id, error = %e, "PR creation failed");
            }
        }
    }

    async fn notify_chat(&self, incident: &Incident, summary: &str) {
        let (Some(chat), Some(channel)) = (&self.chat, &self.chat_channel) else {
            return;
        };
        let text = format!(
            "Incident #{} ({}) {summary}",
            incident.id, incident.title
        );
        if let Err(e) = chat.post_message(channel, &text, None).await {
            warn!(incident_id = incident.id, error = %e, "chat notification failed");
        }
    }

    /// `rca_cursor_slack`: deep RCA summary to chat for an incident that
    /// already has a root cause.
    async fn handle_rca_notify(&self, incident_id: i64, _user_id: Option<i64>) {
        let (incident, _logs) = match self.load_incident_and_logs(incident_id).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(incident_id, error = %e, "rca notify: incident unavailable");
                return;
            }
        };
        let Some(root_cause) = &incident.root_cause else {
            warn!(incident_id, "rca notify requested without a root cause");
            return;
        };
        let summary = format!("root cause: {}", root_cause.chars().take(400).collect::<String>());
        self.notify_chat(&incident, &summary).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pipeline::bus::InProcessBus;
    use pipeline::config::PipelineConfig;
    use pipeline::incident::{IncidentSeverity, IncidentStatus, LogSeverity};
    use pipeline::knowledge::{HashEmbedder, KnowledgeRetriever};
    use pipeline::ledger::{InMemoryLedger, ResolutionLedger, ResolutionState};
    use pipeline::memory::{FailsafeMemory, InMemoryMemoryStore};
    use pipeline::planner::CompletionClient;
    use pipeline::reducer::{fallback_title_description, TitleGenerator};
    use pipeline::storage::memory::InMemoryStore;
    use serde_json::json;

    struct StaticTitles;

    #[async_trait]
    impl TitleGenerator for StaticTitles {
        async fn generate(
            &self,
            log: &LogEntry,
            _service: &str,
        ) -> anyhow::Result<(String, String)> {
            Ok(fallback_title_description(log))
        }
    }

    /// Same reply for every call; enough to script the worker paths.
    struct FixedLlm(&'static str);

    #[async_trait]
    impl CompletionClient for FixedLlm {
        async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
            // Planning prompts get a plan, tool prompts get a batch,
            // analysis prompts get a root cause.
            if prompt.contains("planning assistant") {
                return Ok(r#"[{"step_number": 1, "description": "Apply the fix"}]"#.into());
            }
            if prompt.contains("tool invocations") {
                return Ok(
                    r#"[{"tool": "write_file", "path": "src/fix.ts", "content": "patched"}]"#
                        .into(),
                );
            }
            if prompt.contains("root cause") || prompt.contains("diagnosing") {
                return Ok(self.0.to_string());
            }
            Ok(self.0.to_string())
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        ledger: Arc<InMemoryLedger>,
        worker: Arc<IncidentWorker>,
    }

    fn harness(small_reply: &'static str, scratch: &std::path::Path) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let bus = Arc::new(InProcessBus::with_partitions(1));
        let requests = Arc::new(ResolutionRequests::new(ledger.clone(), bus));
        let reducer = Arc::new(LogReducer::new(
            store.clone(),
            store.clone(),
            store.clone(),
            requests.clone(),
            Arc::new(StaticTitles),
            None,
            None,
            PipelineConfig::default(),
        ));
        let analyzer = Arc::new(RootCauseAnalyzer::new(Arc::new(FixedLlm(
            r#"{"root_cause": "null deref in handler", "affected_files": ["src/fix.ts"], "suggested_action": "guard the lookup"}"#,
        ))));
        let scratch_dir = scratch.to_string_lossy().into_owned();
        let small_for_loop: &'static str = small_reply;
        let loop_factory = Arc::new(SharedDepsFactory {
            build_deps: Box::new(move || {
                let mut config = crate::config::EngineConfig::default();
                config.scratchpad_dir = scratch_dir.clone();
                config.max_agent_iterations = 10;
                AgentLoopDeps {
                    llm: Arc::new(FixedLlm("{}")),
                    small_llm: Arc::new(FixedLlm(small_for_loop)),
                    repo: None,
                    memory: Arc::new(FailsafeMemory::new(Arc::new(InMemoryMemoryStore::new()))),
                    knowledge: Arc::new(KnowledgeRetriever::new(Arc::new(HashEmbedder::new()))),
                    artifacts: None,
                    config,
                }
            }),
        });
        let worker = Arc::new(IncidentWorker {
            reducer,
            requests,
            incidents: store.clone(),
            logs: store.clone(),
            analyzer,
            loop_factory,
            repo: None,
            tickets: None,
            chat: None,
            chat_channel: None,
            active_jobs: Mutex::new(0),
        });
        Harness {
            store,
            ledger,
            worker,
        }
    }

    async fn seed_incident(store: &InMemoryStore, message: &str) -> i64 {
        let now = Utc::now();
        let log = LogEntry {
            id: 1,
            timestamp: now,
            service_name: "svc".into(),
            severity: LogSeverity::Error,
            message: message.into(),
            source: "app".into(),
            user_id: 7,
            integration_id: None,
            metadata: json!({}),
        };
        store.put_log(log).await;
        let incident = Incident {
            id: 0,
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
            root_cause: None,
            action_taken: None,
            code_fix_explanation: None,
            pr_info: None,
        };
        store.insert_incident(incident).await.unwrap()
    }

    #[tokio::test]
    async fn claim_loser_drops_the_task() {
        // Scenario S5: two deliveries of the same resolve task; the second
        // sees the claim already taken and does nothing.
        let dir = tempfile::tempdir().unwrap();
        let h = harness(r#"{"is_node_modules": false}"#, dir.path());
        let incident_id = seed_incident(&h.store, "boom at /app/src/fix.ts:1:1 something long enough").await;
        h.ledger.upsert_queued(incident_id, 7, "test").await.unwrap();

        h.worker.handle_resolve(incident_id, 7).await;
        let after_first = h.ledger.get(incident_id).await.unwrap().unwrap();
        assert!(after_first.state.is_terminal());
        assert_eq!(after_first.attempts, 1);

        // Redelivery: claim fails (row is terminal), worker drops it.
        h.worker.handle_resolve(incident_id, 7).await;
        let after_second = h.ledger.get(incident_id).await.unwrap().unwrap();
        assert_eq!(after_second.attempts, 1);
    }

    #[tokio::test]
    async fn successful_run_completes_ledger_and_resolves_incident() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(r#"{"is_node_modules": false}"#, dir.path());
        let incident_id = seed_incident(&h.store, "boom").await;
        h.ledger.upsert_queued(incident_id, 7, "test").await.unwrap();

        h.worker.handle_resolve(incident_id, 7).await;

        let row = h.ledger.get(incident_id).await.unwrap().unwrap();
        assert_eq!(row.state, ResolutionState::Completed);
        let incident = h.store.get_incident(incident_id).await.unwrap().unwrap();
        assert_eq!(incident.status, IncidentStatus::Resolved);
        assert_eq!(incident.root_cause.as_deref(), Some("null deref in handler"));
        assert!(incident.resolved_at.is_some());
    }

    #[tokio::test]
    async fn external_code_incident_completes_without_failure() {
        // Scenario S3 / property 9: guard fires → ledger COMPLETED, no PR,
        // explanation recorded.
        let dir = tempfile::tempdir().unwrap();
        let h = harness(r#"{"is_node_modules": true}"#, dir.path());
        let trace = "TypeError: x\n    at a (/app/node_modules/lib/a.js:1:1)\n    at b (/app/node_modules/lib/b.js:2:2)";
        let incident_id = seed_incident(&h.store, trace).await;
        h.ledger.upsert_queued(incident_id, 7, "test").await.unwrap();

        h.worker.handle_resolve(incident_id, 7).await;

        let row = h.ledger.get(incident_id).await.unwrap().unwrap();
        assert_eq!(row.state, ResolutionState::Completed);
        let incident = h.store.get_incident(incident_id).await.unwrap().unwrap();
        let explanation = incident.code_fix_explanation.unwrap();
        assert!(explanation.starts_with("## Why we didn't auto-resolve this incident"));
        assert!(incident.pr_info.is_none());
    }

    #[tokio::test]
    async fn missing_incident_fails_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(r#"{"is_node_modules": false}"#, dir.path());
        h.ledger.upsert_queued(999, 7, "test").await.unwrap();

        h.worker.handle_resolve(999, 7).await;

        let row = h.ledger.get(999).await.unwrap().unwrap();
        assert_eq!(row.state, ResolutionState::Failed);
        assert!(row.last_error.unwrap().contains("not found"));
    }
}
