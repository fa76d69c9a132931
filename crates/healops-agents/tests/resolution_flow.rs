//! End-to-end slice: logs flow through the bus into the reducer, the
//! reducer opens an incident and queues resolution, the worker claims and
//! runs the agent loop, and the incident ends up resolved with a fix in
//! its workspace record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;

use healops_agents::agent_loop::AgentLoopDeps;
use healops_agents::analysis::RootCauseAnalyzer;
use healops_agents::config::EngineConfig;
use healops_agents::worker::{IncidentWorker, SharedDepsFactory};
use pipeline::bus::{IncidentTask, InProcessBus, MessageBus, TaskEnvelope, Topic};
use pipeline::config::PipelineConfig;
use pipeline::incident::{IncidentSeverity, IncidentStatus, LogEntry, LogSeverity};
use pipeline::knowledge::{HashEmbedder, KnowledgeRetriever};
use pipeline::ledger::{InMemoryLedger, ResolutionLedger, ResolutionRequests, ResolutionState};
use pipeline::memory::{FailsafeMemory, InMemoryMemoryStore};
use pipeline::planner::CompletionClient;
use pipeline::reducer::{fallback_title_description, LogReducer, TitleGenerator};
use pipeline::storage::memory::InMemoryStore;
use pipeline::storage::{IncidentStore, LogStore, RunArtifactStore};

struct StaticTitles;

#[async_trait]
impl TitleGenerator for StaticTitles {
    async fn generate(&self, log: &LogEntry, _service: &str) -> anyhow::Result<(String, String)> {
        Ok(fallback_title_description(log))
    }
}

/// Routes replies by prompt shape, like a well-behaved model.
struct RoutedLlm;

#[async_trait]
impl CompletionClient for RoutedLlm {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        if prompt.contains("planning assistant") {
            return Ok(r#"[
                {"step_number": 1, "description": "Read the failing handler", "files_to_read": ["src/api/users.ts"]},
                {"step_number": 2, "description": "Guard the null lookup"}
            ]"#
            .into());
        }
        if prompt.contains("tool invocations") {
            if prompt.contains("Guard the null lookup") {
                return Ok(r#"[
                    {"tool": "write_file", "path": "src/api/users.ts", "content": "export function handler(u?: User) { if (!u) return null; return u.name; }"},
                    {"tool": "update_todo", "step_number": 2, "status": "completed"}
                ]"#
                .into());
            }
            return Ok(r#"[{"tool": "list_files", "directory": "src"}]"#.into());
        }
        if prompt.contains("diagnosing") {
            return Ok(r#"{"root_cause": "handler dereferences a missing user", "affected_files": ["src/api/users.ts"], "suggested_action": "guard the lookup"}"#.into());
        }
        if prompt.contains("is_node_modules") {
            return Ok(r#"{"is_node_modules": false}"#.into());
        }
        Ok("{}".into())
    }
}

struct Fixture {
    store: Arc<InMemoryStore>,
    ledger: Arc<InMemoryLedger>,
    bus: Arc<InProcessBus>,
}

async fn start_stack(scratch_dir: String) -> Fixture {
    let store = Arc::new(InMemoryStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let bus = Arc::new(InProcessBus::with_partitions(2));
    let requests = Arc::new(ResolutionRequests::new(ledger.clone(), bus.clone()));

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
    let analyzer = Arc::new(RootCauseAnalyzer::new(Arc::new(RoutedLlm)));
    let artifacts: Arc<InMemoryStore> = store.clone();
    let loop_factory = Arc::new(SharedDepsFactory {
        build_deps: Box::new(move || {
            let mut config = EngineConfig::default();
            config.scratchpad_dir = scratch_dir.clone();
            config.max_agent_iterations = 10;
            AgentLoopDeps {
                llm: Arc::new(RoutedLlm),
                small_llm: Arc::new(RoutedLlm),
                repo: None,
                memory: Arc::new(FailsafeMemory::new(Arc::new(InMemoryMemoryStore::new()))),
                knowledge: Arc::new(KnowledgeRetriever::new(Arc::new(HashEmbedder::new()))),
                artifacts: Some(artifacts.clone()),
                config,
            }
        }),
    });

    let worker = Arc::new(IncidentWorker {
        reducer,
        requests,
        incidents: store.clone() as Arc<dyn IncidentStore>,
        logs: store.clone() as Arc<dyn LogStore>,
        analyzer,
        loop_factory,
        repo: None,
        tickets: None,
        chat: None,
        chat_channel: None,
        active_jobs: Mutex::new(0),
    });

    let _handles = bus.start_consumer(Topic::Incidents, worker).await;
    Fixture { store, ledger, bus }
}

fn log(id: i64, severity: LogSeverity, message: &str) -> LogEntry {
    LogEntry {
        id,
        timestamp: Utc::now(),
        service_name: "svc-a".into(),
        severity,
        message: message.into(),
        source: "app".into(),
        user_id: 7,
        integration_id: None,
        metadata: json!({}),
    }
}

async fn publish_log(bus: &InProcessBus, log_id: i64) {
    // Reducer keying: all logs for one logical incident share a key.
    let published = bus
        .publish(
            Topic::Incidents,
            "7|svc-a|app",
            TaskEnvelope::incident(IncidentTask::ProcessLogEntry { log_id }),
        )
        .await;
    assert!(published);
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn log_to_resolved_incident_end_to_end() {
    let scratch = tempfile::tempdir().unwrap();
    let fixture = start_stack(scratch.path().to_string_lossy().into_owned()).await;

    let trace =
        "TypeError: cannot read name of undefined\n    at handler (/app/src/api/users.ts:12:3)\n    at run (/app/src/index.ts:4:1)";
    fixture.store.put_log(log(1, LogSeverity::Error, trace)).await;
    publish_log(&fixture.bus, 1).await;

    // The incident is created, resolution claimed, run, and completed.
    let store = fixture.store.clone();
    let ledger = fixture.ledger.clone();
    wait_for(|| {
        let ledger = ledger.clone();
        async move {
            matches!(
                ledger.get(1).await.unwrap(),
                Some(row) if row.state == ResolutionState::Completed
            )
        }
    })
    .await;

    let incident = store.get_incident(1).await.unwrap().unwrap();
    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert_eq!(incident.severity, IncidentSeverity::Medium);
    assert_eq!(incident.log_ids, vec![1]);
    assert_eq!(
        incident.root_cause.as_deref(),
        Some("handler dereferences a missing user")
    );

    // The workspace snapshot carries the fix.
    let record = store.load_workspace(1).await.unwrap().unwrap();
    assert!(record
        .files
        .get("src/api/users.ts")
        .is_some_and(|content| content.contains("if (!u) return null;")));
}

#[tokio::test(flavor = "multi_thread")]
async fn second_log_merges_and_escalates_without_new_incident() {
    let scratch = tempfile::tempdir().unwrap();
    let fixture = start_stack(scratch.path().to_string_lossy().into_owned()).await;

    fixture
        .store
        .put_log(log(1, LogSeverity::Error, "NullPointerException at X something long enough"))
        .await;
    publish_log(&fixture.bus, 1).await;

    let ledger = fixture.ledger.clone();
    wait_for(|| {
        let ledger = ledger.clone();
        async move { ledger.get(1).await.unwrap().is_some_and(|r| r.state.is_terminal()) }
    })
    .await;

    // Reopen the incident so the second log can merge into an OPEN one.
    let mut incident = fixture.store.get_incident(1).await.unwrap().unwrap();
    let reopened = pipeline::incident::Incident {
        status: IncidentStatus::Open,
        ..incident.clone()
    };
    fixture.store.update_incident(&reopened).await.unwrap();
    incident = reopened;
    assert_eq!(incident.severity, IncidentSeverity::Medium);

    fixture
        .store
        .put_log(log(2, LogSeverity::Critical, "NullPointerException at X (worse)"))
        .await;
    publish_log(&fixture.bus, 2).await;

    let store = fixture.store.clone();
    wait_for(|| {
        let store = store.clone();
        async move {
            store
                .get_incident(1)
                .await
                .unwrap()
                .is_some_and(|i| i.log_ids.len() == 2)
        }
    })
    .await;

    let merged = fixture.store.get_incident(1).await.unwrap().unwrap();
    assert_eq!(merged.log_ids, vec![1, 2]);
    assert_eq!(merged.severity, IncidentSeverity::Critical);
    // No second incident appeared.
    assert!(fixture.store.get_incident(2).await.unwrap().is_none());
}
